//! Morpheus: real-time GPU video effects CLI.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use image::RgbaImage;
use morpheus::config::{apply_config_changes, Config, ConfigWatcher, PendingChanges};
use morpheus::display::{
    ContextConfig, ContextError, ContextFactory, ContextParts, DisplayContext, HeadlessWindow,
};
use morpheus::effects::{BackgroundCapture, BackgroundImage, Effect, EffectControls, EffectEngine};
use morpheus::frame::VideoFrame;
use morpheus::gpu::{to_rgba8, Texture, TextureFormat, WgpuDevice};
use morpheus::utils::{FpsCounter, FramePacer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// How long the renderer waits for a published frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Device the display context renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// CPU rasterizer, works everywhere
    Software,
    /// Hardware GPU through wgpu
    Gpu,
}

/// Real-time GPU video effects.
#[derive(Parser, Debug)]
#[command(name = "morpheus")]
#[command(about = "Apply video effects to a frame stream on the GPU")]
struct Args {
    /// Input image streamed as video (a test pattern when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Where to write the last processed frame
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Effect to apply
    #[arg(short, long)]
    effect: Option<Effect>,

    /// Mirror the output horizontally
    #[arg(long)]
    mirror: bool,

    /// Replacement image for the background effect
    #[arg(long)]
    background: Option<PathBuf>,

    /// Rendering backend
    #[arg(long, value_enum, default_value = "software")]
    backend: Backend,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload the configuration file when it changes
    #[arg(long, requires = "config")]
    watch: bool,

    /// Frames to process, 0 streams until interrupted
    #[arg(long, default_value = "1")]
    frames: u64,

    /// Target frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// List available effects and exit
    #[arg(long)]
    list_effects: bool,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list_effects {
        println!("Available effects:");
        for effect in Effect::ALL {
            println!("  {:<12} {}", effect.as_str(), effect.description());
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(effect) = args.effect {
        config.effects.effect = effect;
    }
    if args.mirror {
        config.effects.mirror = true;
    }
    if let Some(background) = &args.background {
        config.effects.background = Some(background.clone());
    }

    let source = match &args.input {
        Some(path) => image::open(path)
            .with_context(|| format!("failed to open input {:?}", path))?
            .to_rgba8(),
        None => test_pattern(config.context.width, config.context.height),
    };
    config.context.width = source.width();
    config.context.height = source.height();

    info!("Starting Morpheus...");
    run(&args, config, VideoFrame::from_rgba_image(source))
}

fn factory(backend: Backend) -> ContextFactory {
    Box::new(move |config: &ContextConfig| -> Result<ContextParts, ContextError> {
        let (window, _) = HeadlessWindow::new(config.double_buffered);
        match backend {
            Backend::Software => Ok(ContextParts::software(window)),
            Backend::Gpu => Ok(ContextParts {
                device: Box::new(WgpuDevice::new_headless()?),
                window: Box::new(window),
            }),
        }
    })
}

fn run(args: &Args, config: Config, frame: VideoFrame) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let ctx = DisplayContext::new(config.context.clone(), factory(args.backend))?;
    ctx.wait_until_ready()?;

    let controls = EffectControls::new();
    let pending = apply_config_changes(None, &config, &controls);
    let (width, height) = (frame.width, frame.height);
    let mut capture = apply_pending(&ctx, &controls, pending, width, height);

    let mut watcher = if args.watch {
        args.config.clone().and_then(ConfigWatcher::new)
    } else {
        None
    };

    let output = {
        let mut guard = ctx.acquire()?;
        guard.gpu().create_texture(width, height, TextureFormat::Rgba8)?
    };
    ctx.set_draw_callback(Box::new(move |gpu, _| {
        if let Err(e) = gpu.present(output.id) {
            warn!("Present failed: {}", e);
        }
    }))?;

    let mut engine = EffectEngine::new(controls.clone());
    let result = thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let producer = s.spawn(|| produce(&ctx, &running, frame, args.frames, args.fps, tx));

        let mut fps = FpsCounter::new();
        let mut rendered = 0u64;
        let mut outcome: Result<()> = Ok(());
        for seq in rx {
            if let Err(e) = ctx.wait_for_frame(seq, Some(FRAME_TIMEOUT)) {
                warn!("Frame {} skipped: {}", seq, e);
                continue;
            }
            // The context keeps the current set; a newer frame may already
            // have replaced `seq`.
            match engine.transform_current(&ctx, &output) {
                Ok(Some(shown)) => trace!("Rendered frame {} for {}", shown, seq),
                Ok(None) => continue,
                Err(e) => {
                    outcome = Err(e.into());
                    break;
                }
            }
            rendered += 1;
            if config.context.visible {
                let _ = ctx.post_redisplay();
            }
            if let Some(fps) = fps.update() {
                info!("Rendering at {:.2} FPS ({}x{})", fps, width, height);
            }

            if let Some(done) = capture.as_ref().and_then(BackgroundCapture::try_result) {
                match done {
                    Ok(()) => info!("Background captured"),
                    Err(e) => warn!("{}", e),
                }
                capture = None;
            }
            if let Some((old, new)) = watcher.as_mut().and_then(ConfigWatcher::check_for_changes) {
                let pending = apply_config_changes(old.as_ref(), &new, &controls);
                if let Some(next) = apply_pending(&ctx, &controls, pending, width, height) {
                    capture = Some(next);
                }
            }
        }
        running.store(false, Ordering::SeqCst);
        if producer.join().is_err() {
            error!("Frame producer panicked");
        }
        info!("Processed {} frames", rendered);
        outcome
    });

    if result.is_ok() {
        if let Some(path) = &args.output {
            save_output(&ctx, &output, path)?;
        }
    }
    engine.stop(&ctx)?;
    if let Ok(mut guard) = ctx.acquire() {
        let _ = guard.gpu().delete_texture(output.id);
    }
    ctx.shutdown();
    info!("Morpheus stopped");
    result
}

/// Publishes `frame` until told to stop or `frames` frames were sent.
fn produce(
    ctx: &DisplayContext,
    running: &AtomicBool,
    frame: VideoFrame,
    frames: u64,
    fps: u32,
    tx: mpsc::Sender<u64>,
) {
    let mut pacer = FramePacer::new(fps);
    let mut sent = 0u64;
    while running.load(Ordering::SeqCst) && (frames == 0 || sent < frames) {
        let published = ctx
            .request_texture_slot(frame.format, frame.width, frame.height)
            .and_then(|slot| ctx.publish_frame(frame.clone(), slot));
        match published {
            Ok(seq) => {
                if tx.send(seq).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Frame producer stopped: {}", e);
                break;
            }
        }
        sent += 1;
        pacer.wait();
    }
}

fn apply_pending(
    ctx: &DisplayContext,
    controls: &EffectControls,
    pending: PendingChanges,
    width: u32,
    height: u32,
) -> Option<BackgroundCapture> {
    if let Some(visible) = pending.visible {
        let _ = ctx.set_visible(visible);
    }
    let path = pending.background?;
    match BackgroundImage::load(&path, width, height) {
        Ok(image) => {
            info!("Background {:?} queued", path);
            Some(controls.set_background(image))
        }
        Err(e) => {
            error!("Failed to load background {:?}: {}", path, e);
            None
        }
    }
}

fn save_output(ctx: &DisplayContext, output: &Texture, path: &Path) -> Result<()> {
    let texels = {
        let mut guard = ctx.acquire()?;
        guard.gpu().read_texture(output.id)?
    };
    let Some(image) = RgbaImage::from_raw(output.width, output.height, to_rgba8(&texels)) else {
        bail!("readback of {}x{} output was truncated", output.width, output.height);
    };
    image
        .save(path)
        .with_context(|| format!("failed to write {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}

/// Colour ramps over a checkerboard, so every effect has something to bend.
fn test_pattern(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width.max(1), height.max(1), |x, y| {
        let checker = if (x / 32 + y / 32) % 2 == 0 { 255 } else { 160 };
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        image::Rgba([r, g, checker, 255])
    })
}
