use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use lcd_hal::{BudgetHeap, BusArbiter, CapabilityAllocator, Clock, MonotonicClock, Pool};
use lcd_panel::{PanelSlot, SimHandle, SimLink};
use lcd_pipeline::{BufferAllocationPlanner, FlushState, Pipeline, PipelineConfig, PixelSpan};

use crate::cli::{Cli, Cmd, Setup};
use crate::scene::Scene;

pub fn run(cli: Cli) -> Result<()> {
    crate::logger::init(cli.log.filter())?;
    match cli.cmd {
        Cmd::Run {
            setup,
            frames,
            busy_polls,
            stall_at,
            stall_frames,
            overlay,
        } => {
            let opts = RunOptions {
                frames,
                busy_polls,
                stall_at,
                stall_frames,
                overlay,
            };
            let summary = simulate(&setup, &opts)?;
            summary.print();
            Ok(())
        }
        Cmd::Plan { setup } => plan(&setup),
        Cmd::Config { setup } => {
            let cfg = load_config(&setup)?;
            println!("{cfg:#?}");
            Ok(())
        }
    }
}

pub struct RunOptions {
    pub frames: u32,
    pub busy_polls: u32,
    pub stall_at: Option<u32>,
    pub stall_frames: u32,
    pub overlay: bool,
}

pub struct Summary {
    pub frames: u32,
    pub flushes: u32,
    pub dma: u32,
    pub sync: u32,
    pub recoveries: u32,
    pub overlays_skipped: u32,
    pub checked: usize,
    pub mismatched: usize,
    pub elapsed_ms: u128,
}

impl Summary {
    fn print(&self) {
        println!(
            "frames={} flushes={} dma={} sync={} recoveries={} overlays_skipped={} elapsed_ms={}",
            self.frames,
            self.flushes,
            self.dma,
            self.sync,
            self.recoveries,
            self.overlays_skipped,
            self.elapsed_ms
        );
        if self.checked > 0 {
            println!("verified {} pixels, {} mismatched", self.checked, self.mismatched);
        }
    }
}

fn load_config(setup: &Setup) -> Result<PipelineConfig> {
    let mut cfg = match &setup.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            PipelineConfig::parse(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    for item in &setup.overrides {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("--set expects KEY=VALUE, got {item:?}"))?;
        cfg.set(key.trim(), value.trim())
            .with_context(|| format!("--set {item}"))?;
    }
    Ok(cfg)
}

fn heap(setup: &Setup) -> BudgetHeap {
    let mut heap = BudgetHeap::new()
        .with_budget(Pool::Dma, setup.dma_kib * 1024)
        .with_budget(Pool::Internal, setup.internal_kib * 1024)
        .with_budget(Pool::External, setup.external_kib * 1024);
    if let Some(kib) = setup.max_block_kib {
        for pool in Pool::ALL {
            heap = heap.with_max_block(pool, kib * 1024);
        }
    }
    heap
}

fn plan(setup: &Setup) -> Result<()> {
    let cfg = load_config(setup)?;
    let allocator = CapabilityAllocator::new(heap(setup));
    let plan = BufferAllocationPlanner::new(&allocator)
        .plan(&cfg.plan_request())
        .context("planning buffers")?;

    let d = &plan.draw;
    println!(
        "draw: {} lines x{} in {} ({} bpp){}",
        d.lines,
        plan.draw_buffers.len(),
        d.pool,
        d.bits_per_pixel,
        if d.full_frame { ", full frame" } else { "" }
    );
    match &plan.transfer {
        Some(t) if t.is_owned() => {
            println!("transfer: {} lines bounce buffer in {}", t.lines, t.pool);
        }
        Some(_) => println!("transfer: direct from draw buffers"),
        None if d.full_frame => println!("transfer: none (full frame)"),
        None => println!("transfer: unavailable, synchronous only"),
    }
    match &plan.scratch {
        Some(s) => println!("scratch: {} bytes in {}", s.len(), s.pool()),
        None => println!("scratch: none (per-pixel sync writes)"),
    }
    for pool in Pool::ALL {
        println!("{:>9}: {} bytes free", pool.name(), allocator.free_bytes(pool));
    }
    println!(
        "allocator: {} fallbacks, {} failures",
        allocator.fallback_count(),
        allocator.failure_count()
    );
    Ok(())
}

pub fn simulate(setup: &Setup, opts: &RunOptions) -> Result<Summary> {
    let cfg = load_config(setup)?;
    let (link, sim) = SimLink::new(cfg.width, cfg.height, !setup.no_engine);
    sim.set_busy_polls(opts.busy_polls);

    let slot: PanelSlot<SimLink> = PanelSlot::new();
    let panel = slot.get_or_select(cfg.backend, cfg.width, cfg.height, || link);
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let bus = Arc::new(BusArbiter::new(Arc::clone(&clock)));
    let allocator = CapabilityAllocator::new(heap(setup));
    let mut pipeline = Pipeline::new(cfg.clone(), allocator, panel, bus, clock)
        .context("initializing pipeline")?;

    let scene = Scene::new(&cfg);
    let lines = pipeline.geometry().lines;
    let buffers = pipeline.draw_buffer_count();
    let bpp = scene.bytes_per_pixel();
    let started = Instant::now();

    let mut submitted = 0usize;
    let mut completed = 0usize;
    let mut next_buffer = 0usize;

    for frame in 0..opts.frames {
        if let Some(at) = opts.stall_at {
            if frame == at {
                log::warn!("[SIM] engine wedged at frame {}", frame);
                sim.set_stalled(true);
            } else if frame == at + opts.stall_frames {
                log::warn!("[SIM] engine released at frame {}", frame);
                sim.set_stalled(false);
            }
        }

        let mut y = 0;
        while y < cfg.height {
            let chunk = lines.min(cfg.height - y);
            // A buffer is free once every flush submitted from it completed.
            while submitted - completed >= buffers {
                pipeline.tick();
                completed += drain(&mut pipeline);
            }
            let Some(buf) = pipeline.draw_buffer_mut(next_buffer) else {
                bail!("draw buffer {next_buffer} missing");
            };
            let rect = scene.render(frame, y, chunk, buf);
            let len = rect.pixel_count() * bpp;
            // SAFETY: the buffer is not written again until this flush's
            // completion has been drained.
            let span = unsafe { PixelSpan::from_raw(buf.as_ptr(), len) }
                .context("draw buffer has no address")?;
            pipeline.flush(rect, span);
            submitted += 1;
            completed += drain(&mut pipeline);
            next_buffer = (next_buffer + 1) % buffers;
            y += chunk;
        }

        if opts.overlay {
            let label = format!("frame {frame}");
            pipeline.overlay(|p| p.draw_text((2, 2), &label, 0xFFFF));
        }
        if pipeline.take_full_repaint() {
            log::info!("[SIM] full repaint requested after frame {}", frame);
        }
    }

    while pipeline.state() != FlushState::Idle || completed < submitted {
        pipeline.tick();
        completed += drain(&mut pipeline);
    }
    pipeline.dump_stats();

    let (checked, mismatched) = if opts.overlay || opts.frames == 0 {
        (0, 0)
    } else {
        verify(&sim, &scene, &cfg, opts.frames - 1)
    };
    let stats = pipeline.stats();
    Ok(Summary {
        frames: opts.frames,
        flushes: stats.flush_count,
        dma: stats.dma_flush_count,
        sync: stats.sync_flush_count,
        recoveries: stats.recovery_count,
        overlays_skipped: stats.overlay_skipped,
        checked,
        mismatched,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

fn drain(pipeline: &mut Pipeline<SimLink>) -> usize {
    let mut n = 0;
    while pipeline.pop_completion().is_some() {
        n += 1;
    }
    n
}

fn verify(sim: &SimHandle, scene: &Scene, cfg: &PipelineConfig, frame: u32) -> (usize, usize) {
    let mut mismatched = 0;
    for y in 0..cfg.height {
        for x in 0..cfg.width {
            if sim.pixel(x, y) != scene.expected(frame, x, y) {
                mismatched += 1;
            }
        }
    }
    (usize::from(cfg.width) * usize::from(cfg.height), mismatched)
}
