//! Integration tests for the producer -> display context -> effect path

use morpheus::display::{ContextConfig, ContextError, ContextParts, DisplayContext, HeadlessWindow};
use morpheus::effects::{Effect, EffectControls, EffectEngine, EngineError};
use morpheus::filter::{FilterStage, ShaderFilter};
use morpheus::frame::{VideoFormat, VideoFrame};
use morpheus::gpu::{
    to_rgba8, Fragment, GpuError, SoftwareDevice, Texture, TextureFormat, TextureUnit,
};
use morpheus::shader::{with_prelude, PASSTHROUGH_FRAGMENT};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn headless() -> DisplayContext {
    let ctx = DisplayContext::headless(ContextConfig::default()).unwrap();
    ctx.wait_until_ready().unwrap();
    ctx
}

fn gray_frame(width: u32, height: u32, value: u8) -> VideoFrame {
    let data = (0..width * height)
        .flat_map(|_| [value, value, value, 255])
        .collect();
    VideoFrame::from_data(width, height, VideoFormat::Rgba, data)
}

fn copy(f: &Fragment<'_>) -> [f32; 4] {
    f.sample(TextureUnit::Tex, f.uv)
}

fn output_texture(ctx: &DisplayContext, width: u32, height: u32) -> Texture {
    ctx.acquire()
        .unwrap()
        .gpu()
        .create_texture(width, height, TextureFormat::Rgba8)
        .unwrap()
}

fn read(ctx: &DisplayContext, texture: &Texture) -> Vec<u8> {
    to_rgba8(&ctx.acquire().unwrap().gpu().read_texture(texture.id).unwrap())
}

#[test]
fn test_stream_switches_effect_live() {
    let ctx = headless();
    let controls = EffectControls::new();
    let mut engine = EffectEngine::new(controls.clone());
    let output = output_texture(&ctx, 8, 6);

    let values = [10u8, 60, 0, 0];
    let (tx, rx) = mpsc::channel();
    let (ack_tx, ack_rx) = mpsc::channel::<()>();
    let producer_ctx = &ctx;
    thread::scope(|s| {
        s.spawn(move || {
            let ctx = producer_ctx;
            for value in values {
                let slot = ctx.request_texture_slot(VideoFormat::Rgba, 8, 6).unwrap();
                let seq = ctx.publish_frame(gray_frame(8, 6, value), slot).unwrap();
                tx.send((seq, value)).unwrap();
                // One frame in flight, so each render sees its own frame.
                ack_rx.recv().unwrap();
            }
        });

        for (i, (seq, value)) in rx.iter().take(values.len()).enumerate() {
            if i == 2 {
                controls.set_effect(Effect::Heat);
            }
            ctx.wait_for_frame(seq, WAIT).unwrap();
            let shown = engine.transform_current(&ctx, &output).unwrap();
            assert_eq!(shown, Some(seq));
            let pixels = read(&ctx, &output);
            assert!(pixels.chunks(4).all(|p| p == [value, value, value, 255]));
            ack_tx.send(()).unwrap();
        }
    });

    assert_eq!(engine.frames(), 4);
    engine.stop(&ctx).unwrap();
}

#[test]
fn test_frames_in_flight_recycle_each_set_once() {
    const FRAMES: u64 = 24;
    let ctx = headless();
    let mut engine = EffectEngine::new(EffectControls::new());
    let output = output_texture(&ctx, 4, 4);
    let value_of = |seq: u64| (seq * 10 % 250) as u8;

    let (tx, rx) = mpsc::channel();
    let producer_ctx = &ctx;
    thread::scope(|s| {
        s.spawn(move || {
            let ctx = producer_ctx;
            for i in 1..=FRAMES {
                let slot = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
                // A slot is never the frame being displayed.
                if let Some(current) = ctx.current_frame() {
                    assert!(!current.textures.overlaps(&slot));
                }
                let seq = ctx.publish_frame(gray_frame(4, 4, value_of(i)), slot).unwrap();
                assert_eq!(seq, i);
                tx.send(seq).unwrap();
            }
        });

        let mut last = 0;
        for seq in rx.iter() {
            // Slow consumer: the producer runs ahead and frames get superseded.
            thread::sleep(Duration::from_millis(2));
            ctx.wait_for_frame(seq, WAIT).unwrap();
            let shown = engine.transform_current(&ctx, &output).unwrap().unwrap();
            assert!(shown >= seq && shown >= last);
            last = shown;
            let v = value_of(shown);
            let pixels = read(&ctx, &output);
            assert!(pixels.chunks(4).all(|p| p == [v, v, v, 255]), "frame {}", shown);
        }
        assert_eq!(last, FRAMES);
    });

    let mut guard = ctx.acquire().unwrap();
    let (_, pool) = guard.gpu_and_pool();
    // Producer slot, pending candidate and current frame at most.
    assert!(pool.allocations() <= 3);
    assert_eq!(pool.allocations() + pool.reuses(), FRAMES);
    drop(guard);
    engine.stop(&ctx).unwrap();
}

#[test]
fn test_pool_reuse_is_idempotent() {
    let ctx = headless();
    let first = ctx.request_texture_slot(VideoFormat::I420, 8, 4).unwrap();
    assert_eq!(first.planes().len(), 3);
    let ids: Vec<_> = first.planes().iter().map(|t| t.id).collect();
    ctx.clear_texture(first).unwrap();

    for _ in 0..3 {
        let set = ctx.request_texture_slot(VideoFormat::I420, 8, 4).unwrap();
        assert_eq!(set.planes().iter().map(|t| t.id).collect::<Vec<_>>(), ids);
        ctx.clear_texture(set).unwrap();
    }

    let mut guard = ctx.acquire().unwrap();
    let (_, pool) = guard.gpu_and_pool();
    assert_eq!(pool.allocations(), 1);
    assert_eq!(pool.reuses(), 3);
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_pool_finds_match_among_mixed_sizes() {
    let ctx = headless();
    let small = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
    let planar = ctx.request_texture_slot(VideoFormat::I420, 8, 4).unwrap();
    let large = ctx.request_texture_slot(VideoFormat::Rgba, 8, 8).unwrap();
    let ids = [small.primary().id, planar.primary().id, large.primary().id];
    for set in [small, planar, large] {
        ctx.clear_texture(set).unwrap();
    }

    let large = ctx.request_texture_slot(VideoFormat::Rgba, 8, 8).unwrap();
    assert_eq!(large.primary().id, ids[2]);
    let planar = ctx.request_texture_slot(VideoFormat::I420, 8, 4).unwrap();
    assert_eq!(planar.primary().id, ids[1]);
    let small = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
    assert_eq!(small.primary().id, ids[0]);

    let mut guard = ctx.acquire().unwrap();
    let (_, pool) = guard.gpu_and_pool();
    assert_eq!(pool.allocations(), 3);
    assert_eq!(pool.reuses(), 3);
    assert!(pool.is_empty());
}

#[test]
fn test_engine_and_filter_share_the_context() {
    let ctx = headless();
    let (engine_in, engine_out, filter_in, filter_out) = {
        let mut guard = ctx.acquire().unwrap();
        let gpu = guard.gpu();
        let mut solid = |value: u8| {
            let texture = gpu.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
            gpu.upload_texture(texture.id, &[value; 64]).unwrap();
            texture
        };
        (solid(200), solid(0), solid(50), solid(0))
    };

    let controls = EffectControls::new();
    controls.set_effect(Effect::Blur);
    let mut engine = EffectEngine::new(controls);
    let filter = ShaderFilter::new(
        "copy",
        with_prelude(PASSTHROUGH_FRAGMENT),
        Some(copy),
    )
    .unwrap();
    let mut stage = FilterStage::new(filter);

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                engine.transform(&ctx, &engine_in, &engine_out).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..20 {
                stage.transform(&ctx, &filter_in, &filter_out).unwrap();
            }
        });
    });

    assert!(read(&ctx, &engine_out).iter().all(|&b| b == 200));
    assert!(read(&ctx, &filter_out).iter().all(|&b| b == 50));

    engine.stop(&ctx).unwrap();
    stage.stop(&ctx).unwrap();
    let stats = ctx.acquire().unwrap().gpu().stats();
    assert_eq!(stats.programs_alive, 0);
    assert_eq!(stats.framebuffers_alive, 0);
}

#[test]
fn test_teardown_releases_frame_waiter() {
    let ctx = Arc::new(headless());
    let waiter = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.wait_for_frame(1, None))
    };
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    ctx.teardown();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(ContextError::TornDown)));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_engine_fails_after_teardown() {
    let ctx = headless();
    let output = output_texture(&ctx, 2, 2);
    let input = output_texture(&ctx, 2, 2);
    ctx.shutdown();

    let mut engine = EffectEngine::new(EffectControls::new());
    assert!(matches!(
        engine.transform(&ctx, &input, &output),
        Err(EngineError::Context(ContextError::TornDown))
    ));
    assert!(matches!(
        ctx.request_texture_slot(VideoFormat::Rgba, 2, 2),
        Err(ContextError::TornDown)
    ));
}

#[test]
fn test_texture_allocation_failure_is_recoverable() {
    let (window, _) = HeadlessWindow::new(true);
    let ctx = DisplayContext::new(
        ContextConfig::default(),
        Box::new(move |_| {
            Ok(ContextParts {
                device: Box::new(SoftwareDevice::with_memory_budget(64)),
                window: Box::new(window),
            })
        }),
    )
    .unwrap();

    assert!(matches!(
        ctx.request_texture_slot(VideoFormat::Rgba, 8, 8),
        Err(ContextError::Gpu(GpuError::OutOfMemory { .. }))
    ));
    // Smaller requests still succeed on the same context.
    let set = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
    let seq = ctx.publish_frame(gray_frame(4, 4, 7), set).unwrap();
    assert_eq!(ctx.wait_for_frame(seq, WAIT).unwrap().seq, seq);
}
