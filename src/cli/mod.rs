use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ytscript",
    about = "Resilient YouTube transcript acquisition with caption, scrape and audio fallbacks",
    version,
    long_about = "Fetches YouTube transcripts through a fixed fallback chain: the official captions API, the timedtext endpoint, a player-response scrape behind a circuit breaker, and finally an audio download transcribed by a speech-to-text backend. Proxy sessions are sticky per job and cookies are only ever consumed by the audio stage."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch the transcript for a single video
    Fetch {
        /// Video id or YouTube URL
        #[arg(value_name = "VIDEO")]
        video: String,

        /// User whose stored cookies the audio stage may use
        #[arg(short, long, value_name = "USER_ID")]
        user: Option<String>,

        /// Preferred caption language (repeat for fallback order)
        #[arg(short, long, value_name = "LANG")]
        language: Vec<String>,

        /// Output file path (prints to console if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output format (defaults to the configured format)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Treat the video as captionless and go straight to the audio stage
        #[arg(long)]
        no_captions_hint: bool,

        /// Print pipeline metrics after the run
        #[arg(long)]
        stats: bool,
    },

    /// Fetch transcripts for several videos concurrently
    Batch {
        /// Video ids or YouTube URLs
        #[arg(value_name = "VIDEOS", required = true)]
        videos: Vec<String>,

        /// User whose stored cookies the audio stage may use
        #[arg(short, long, value_name = "USER_ID")]
        user: Option<String>,

        /// Preferred caption language (repeat for fallback order)
        #[arg(short, long, value_name = "LANG")]
        language: Vec<String>,

        /// Directory for per-video transcript files (prints if not specified)
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Output format (defaults to the configured format)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Treat every video as captionless and go straight to the audio stage
        #[arg(long)]
        no_captions_hint: bool,

        /// Print pipeline metrics after the run
        #[arg(long)]
        stats: bool,
    },

    /// Probe the proxy gateway and report reachability
    Preflight,

    /// Show or initialize configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain transcript text
    Text,
    /// JSON with stage attempt diagnostics
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
        }
    }

    /// Parse the configured default; validation rejects anything else, so
    /// unknown names just fall back to text.
    pub fn from_config_name(name: &str) -> Self {
        match name {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}
