use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rollcall_core::pipeline::{FrameSource, SourceError};
use rollcall_core::{
    AttendanceSession, ConfirmPolicy, EmbeddingExtractor, EnrolledIdentity, FaceLocator, Frame,
    MatchPolicy, Matcher, OnnxEmbeddingExtractor, OnnxFaceLocator, Pipeline,
};
use rollcall_store::Store;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Directory containing ONNX model files
    /// (default: $ROLLCALL_MODEL_DIR, then ~/.local/share/rollcall/models)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// SQLite database path
    /// (default: $ROLLCALL_DB_PATH, then ~/.local/share/rollcall/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from one or more reference photos
    Enroll {
        /// Stable student identifier (e.g., registration number)
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Reference photo files
        photos: Vec<PathBuf>,
    },
    /// Remove an enrolled student
    Remove { id: String },
    /// List enrolled students
    List,
    /// Run one attendance session over a directory of frame images
    Run {
        /// Directory of frame images, processed in filename order
        frames_dir: PathBuf,
        /// Camera/stream identifier recorded with the session
        #[arg(long, default_value = "cli")]
        camera: String,
        /// Maximum cosine distance for a positive match
        #[arg(long, default_value_t = 0.35)]
        threshold: f32,
        /// Minimum distance gap to the second-nearest identity
        #[arg(long, default_value_t = 0.10)]
        margin: f32,
        /// Positive matches required to confirm attendance
        #[arg(long, default_value_t = 3)]
        confirm_matches: u32,
        /// Confirmation window in milliseconds
        #[arg(long, default_value_t = 2000)]
        window_ms: u64,
        /// Process every Kth frame
        #[arg(long, default_value_t = 1)]
        sample_every: u64,
    },
    /// List recorded sessions
    Sessions,
    /// Print one session's attendance as JSON (latest if omitted)
    Export { session: Option<String> },
    /// Print the latest session's roster
    Summary,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let model_dir = resolve_model_dir(cli.model_dir);
    let db_path = resolve_db_path(cli.db);

    match cli.command {
        Commands::Enroll { id, name, photos } => enroll(&model_dir, &db_path, id, name, &photos),
        Commands::Remove { id } => {
            let mut store = Store::open(&db_path)?;
            if store.remove_identity(&id)? {
                println!("removed {id}");
            } else {
                println!("{id} is not enrolled");
            }
            Ok(())
        }
        Commands::List => {
            let store = Store::open(&db_path)?;
            let identities = store.list_identities()?;
            if identities.is_empty() {
                println!("no students enrolled");
            }
            for identity in identities {
                println!(
                    "{}  {} ({} reference{})",
                    identity.id,
                    identity.display_name,
                    identity.reference_count,
                    if identity.reference_count == 1 { "" } else { "s" },
                );
            }
            Ok(())
        }
        Commands::Run {
            frames_dir,
            camera,
            threshold,
            margin,
            confirm_matches,
            window_ms,
            sample_every,
        } => run_session(
            &model_dir,
            &db_path,
            &frames_dir,
            &camera,
            MatchPolicy { threshold, margin },
            ConfirmPolicy {
                required_matches: confirm_matches,
                window: chrono::Duration::milliseconds(window_ms as i64),
            },
            sample_every,
        ),
        Commands::Sessions => {
            let store = Store::open(&db_path)?;
            for session in store.list_sessions()? {
                let state = match session.ended_at {
                    Some(ended) => format!("ended {}", ended.format("%Y-%m-%d %H:%M:%S")),
                    None => "open".to_string(),
                };
                println!(
                    "{}  {}  started {}  {}  {} present",
                    session.id,
                    session.camera_id,
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    state,
                    session.attended,
                );
            }
            Ok(())
        }
        Commands::Export { session } => {
            let store = Store::open(&db_path)?;
            let session_id = resolve_session_id(&store, session)?;
            let rows = store.attendance_for(&session_id)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Commands::Summary => {
            let store = Store::open(&db_path)?;
            let session_id = resolve_session_id(&store, None)?;
            print_summary(&store, &session_id)
        }
    }
}

/// Pull-style frame source over a directory of images, in filename
/// order. Capture timestamps are assigned at read time.
struct DirFrameSource {
    files: std::vec::IntoIter<PathBuf>,
    camera_id: String,
}

impl DirFrameSource {
    fn open(dir: &Path, camera_id: &str) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            bail!("no frame files in {}", dir.display());
        }
        Ok(Self {
            files: files.into_iter(),
            camera_id: camera_id.to_string(),
        })
    }
}

impl FrameSource for DirFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };
        let frame = load_frame(&path, &self.camera_id).map_err(SourceError::new)?;
        Ok(Some(frame))
    }
}

/// Decode an image file into a grayscale frame.
fn load_frame(path: &Path, camera_id: &str) -> Result<Frame> {
    let gray = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_luma8();
    Ok(Frame {
        width: gray.width(),
        height: gray.height(),
        data: gray.into_raw(),
        timestamp: Utc::now(),
        camera_id: camera_id.to_string(),
    })
}

fn enroll(
    model_dir: &Path,
    db_path: &Path,
    id: String,
    name: String,
    photos: &[PathBuf],
) -> Result<()> {
    if photos.is_empty() {
        bail!("at least one reference photo is required");
    }

    let mut locator = load_locator(model_dir)?;
    let mut extractor = load_extractor(model_dir)?;
    let mut references = Vec::new();

    for photo in photos {
        let frame = load_frame(photo, "enroll")?;
        let regions = locator.locate(&frame)?;
        let Some(best) = regions.first() else {
            tracing::warn!(photo = %photo.display(), "no face found, skipping photo");
            continue;
        };
        match extractor.extract(&frame, best) {
            Ok(embedding) => references.push(embedding),
            Err(err) => {
                tracing::warn!(photo = %photo.display(), error = %err, "photo unusable");
            }
        }
    }

    if references.is_empty() {
        bail!("no usable face found in any photo");
    }

    let reference_count = references.len();
    let mut store = Store::open(db_path)?;
    store.enroll_identity(&EnrolledIdentity {
        id: id.clone(),
        display_name: name,
        references,
    })?;

    println!("enrolled {id} with {reference_count} reference embedding(s)");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    model_dir: &Path,
    db_path: &Path,
    frames_dir: &Path,
    camera: &str,
    match_policy: MatchPolicy,
    confirm_policy: ConfirmPolicy,
    sample_every: u64,
) -> Result<()> {
    let mut store = Store::open(db_path)?;
    let gallery = Arc::new(store.load_gallery()?);
    if gallery.is_empty() {
        bail!("no students enrolled; run `rollcall enroll` first");
    }

    let locator = load_locator(model_dir)?;
    let extractor = load_extractor(model_dir)?;
    let matcher = Matcher::new(gallery, match_policy);
    let mut pipeline = Pipeline::new(
        Box::new(locator),
        Box::new(extractor),
        matcher,
        confirm_policy,
        sample_every,
    );

    let mut source = DirFrameSource::open(frames_dir, camera)?;
    let session = drive_session(&mut pipeline, &mut store, &mut source, camera)?;

    print_summary(&store, &session.id.to_string())
}

/// Start a session, run it to completion, and close it in the store —
/// including when the frame loop fails partway, so no session row is
/// left open.
fn drive_session(
    pipeline: &mut Pipeline,
    store: &mut Store,
    source: &mut dyn FrameSource,
    camera: &str,
) -> Result<AttendanceSession> {
    pipeline.start_session();
    let session = pipeline.session().context("session just started")?;
    store.create_session(session, camera)?;

    let cancel = AtomicBool::new(false);
    match pipeline.run(source, store, &cancel) {
        Ok(session) => {
            store.close_session(&session)?;
            Ok(session)
        }
        Err(err) => {
            if let Some(open) = pipeline.end_session() {
                if let Err(close_err) = store.close_session(&open) {
                    tracing::warn!(error = %close_err, "failed to close session after run error");
                }
            }
            Err(err.into())
        }
    }
}

fn print_summary(store: &Store, session_id: &str) -> Result<()> {
    let rows = store.attendance_for(session_id)?;
    println!("session {session_id}: {} present", rows.len());
    for (index, row) in rows.iter().enumerate() {
        println!(
            "{:3}. {} ({}) at {}  confidence {:.2}",
            index + 1,
            row.display_name,
            row.identity_id,
            row.recorded_at.format("%H:%M:%S"),
            row.confidence,
        );
    }
    Ok(())
}

fn resolve_session_id(store: &Store, requested: Option<String>) -> Result<String> {
    if let Some(id) = requested {
        return Ok(id);
    }
    store
        .list_sessions()?
        .first()
        .map(|session| session.id.clone())
        .context("no sessions recorded")
}

fn load_locator(model_dir: &Path) -> Result<OnnxFaceLocator> {
    let path = model_dir.join("version-RFB-320.onnx");
    Ok(OnnxFaceLocator::load(&path.to_string_lossy())?)
}

fn load_extractor(model_dir: &Path) -> Result<OnnxEmbeddingExtractor> {
    let path = model_dir.join("w600k_mbf.onnx");
    Ok(OnnxEmbeddingExtractor::load(&path.to_string_lossy())?)
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn resolve_model_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("ROLLCALL_MODEL_DIR").map(PathBuf::from).ok())
        .unwrap_or_else(|| data_dir().join("models"))
}

fn resolve_db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("ROLLCALL_DB_PATH").map(PathBuf::from).ok())
        .unwrap_or_else(|| data_dir().join("attendance.db"))
}
