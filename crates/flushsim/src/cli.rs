use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flushsim")]
#[command(about = "Run the LCD flush pipeline against a simulated panel")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log: LogLevel,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand)]
pub enum Cmd {
    /// Render and flush a number of frames, then print statistics.
    Run {
        #[command(flatten)]
        setup: Setup,

        #[arg(long, default_value_t = 60)]
        frames: u32,

        /// Each transfer reports busy for this many polls.
        #[arg(long, default_value_t = 2)]
        busy_polls: u32,

        /// Wedge the transfer engine starting at this frame.
        #[arg(long)]
        stall_at: Option<u32>,

        /// Frames the engine stays wedged.
        #[arg(long, default_value_t = 3)]
        stall_frames: u32,

        /// Draw a frame counter on top of each frame.
        #[arg(long)]
        overlay: bool,
    },

    /// Show which buffers the planner would pick, without flushing.
    Plan {
        #[command(flatten)]
        setup: Setup,
    },

    /// Print the effective configuration.
    Config {
        #[command(flatten)]
        setup: Setup,
    },
}

#[derive(Args)]
pub struct Setup {
    /// `key = value` configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override one setting, e.g. `--set reduced_color_mode=on`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// DMA-capable internal memory, KiB.
    #[arg(long, default_value_t = 96)]
    pub dma_kib: usize,

    /// Internal memory without DMA, KiB.
    #[arg(long, default_value_t = 32)]
    pub internal_kib: usize,

    /// External memory, KiB.
    #[arg(long, default_value_t = 4096)]
    pub external_kib: usize,

    /// Largest single block any pool hands out, KiB.
    #[arg(long)]
    pub max_block_kib: Option<usize>,

    /// Simulate wiring without a transfer engine.
    #[arg(long)]
    pub no_engine: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogLevel {
    #[value(name = "off")]
    Off,
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub fn filter(self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}
