use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use ytscript::cli::{Cli, Commands, OutputFormat};
use ytscript::config::Config;
use ytscript::jobs::JobRunner;
use ytscript::output;
use ytscript::pipeline::{AcquisitionRequest, TranscriptPipeline};
use ytscript::proxy::ProxySessionProvider;
use ytscript::utils;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ytscript=debug"
    } else {
        "ytscript=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().await?;

    match cli.command {
        Commands::Fetch {
            video,
            user,
            language,
            output,
            format,
            no_captions_hint,
            stats,
        } => {
            warn_missing_dependencies(&config).await;

            let pipeline = TranscriptPipeline::from_config(&config).await?;
            let video_id = resolve_video_id(&video)?;
            let format = effective_format(format, &config);

            let request = AcquisitionRequest {
                video_id: video_id.clone(),
                user_id: user,
                job_id: Uuid::new_v4(),
                language_preferences: effective_languages(language, &config),
                has_captions_hint: if no_captions_hint { Some(false) } else { None },
            };

            let spinner = make_spinner(cli.quiet, &format!("Acquiring transcript for {}...", video_id));
            let outcome = pipeline.acquire(request).await;
            if let Some(progress) = &spinner {
                progress.finish_and_clear();
            }

            if let Ok(result) = &outcome {
                tracing::info!(stage = %result.source_stage, "transcript acquired");
                match output {
                    Some(path) => {
                        output::save_to_file(result, &path, &format).await?;
                        println!("Transcript saved to: {}", path.display());
                    }
                    None => output::print_to_console(result, &format)?,
                }
            }

            if stats {
                println!("{}", output::format_stats(&pipeline.metrics_snapshot()));
            }

            outcome?;
        }

        Commands::Batch {
            videos,
            user,
            language,
            output_dir,
            format,
            no_captions_hint,
            stats,
        } => {
            warn_missing_dependencies(&config).await;

            let pipeline = Arc::new(TranscriptPipeline::from_config(&config).await?);
            let runner = JobRunner::new(Arc::clone(&pipeline), config.app.max_concurrent_jobs);
            let format = effective_format(format, &config);

            let mut video_ids = Vec::with_capacity(videos.len());
            for video in &videos {
                video_ids.push(resolve_video_id(video)?);
            }

            let spinner = make_spinner(
                cli.quiet,
                &format!("Acquiring transcripts for {} videos...", video_ids.len()),
            );
            let report = runner
                .run(
                    user,
                    video_ids,
                    effective_languages(language, &config),
                    if no_captions_hint { Some(false) } else { None },
                )
                .await;
            if let Some(progress) = &spinner {
                progress.finish_and_clear();
            }

            if let Some(dir) = &output_dir {
                fs_err::create_dir_all(dir)?;
            }
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(result) => match &output_dir {
                        Some(dir) => {
                            let path =
                                dir.join(format!("{}.{}", outcome.video_id, format.extension()));
                            output::save_to_file(result, &path, &format).await?;
                            println!("{}: saved to {}", outcome.video_id, path.display());
                        }
                        None => {
                            println!("--- {} (via {}) ---", outcome.video_id, result.source_stage);
                            output::print_to_console(result, &format)?;
                        }
                    },
                    Err(e) => eprintln!("{}: failed: {}", outcome.video_id, e),
                }
            }

            println!(
                "Batch {}: {} succeeded, {} failed",
                report.job_id,
                report.succeeded(),
                report.failed()
            );

            if stats {
                println!("{}", output::format_stats(&pipeline.metrics_snapshot()));
            }

            if report.failed() > 0 {
                anyhow::bail!(
                    "{} of {} videos failed",
                    report.failed(),
                    report.outcomes.len()
                );
            }
        }

        Commands::Preflight => {
            let provider = ProxySessionProvider::new(config.proxy.clone());
            match (&config.proxy.host, &config.proxy.port) {
                (Some(host), Some(port)) => {
                    println!("Probing proxy gateway {}:{}...", host, port)
                }
                _ => println!("No proxy configured, checking egress policy..."),
            }

            if provider.preflight(Duration::from_secs(5)).await {
                println!("Proxy egress healthy");
            } else {
                anyhow::bail!("Proxy gateway unreachable");
            }
        }

        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                config.save().await?;
                println!(
                    "Configuration written to: {}",
                    Config::config_path()?.display()
                );
            }
        }
    }

    Ok(())
}

/// Surface missing external tools early; the caption stages work without
/// them, so this warns instead of failing.
async fn warn_missing_dependencies(config: &Config) {
    let missing = utils::check_dependencies(&config.audio.yt_dlp_path).await;
    if !missing.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - the audio stage may fail)");
    }
}

fn resolve_video_id(input: &str) -> Result<String> {
    utils::extract_video_id(input)
        .ok_or_else(|| anyhow::anyhow!("'{}' is not a YouTube video id or URL", input))
}

fn effective_languages(flags: Vec<String>, config: &Config) -> Vec<String> {
    if flags.is_empty() {
        config.app.language_preferences.clone()
    } else {
        flags
            .iter()
            .map(|lang| utils::normalize_language_code(lang))
            .collect()
    }
}

fn effective_format(flag: Option<OutputFormat>, config: &Config) -> OutputFormat {
    flag.unwrap_or_else(|| OutputFormat::from_config_name(&config.app.default_output_format))
}

fn make_spinner(quiet: bool, message: &str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    progress.enable_steady_tick(Duration::from_millis(120));
    progress.set_message(message.to_string());
    Some(progress)
}
