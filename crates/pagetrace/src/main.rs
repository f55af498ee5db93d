mod output;
mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pagetrace_core::config::Config;
use pagetrace_core::model::TransactionEvent;
use pagetrace_core::time::parse_duration_str;
use pagetrace_core::trace_header::{TRACE_HEADER_NAME, TraceHeader};
use pagetrace_trace::{
    RouteTracer, RouteTracerOptions, Sampler, SpanContext, Tracer, TransactionSink,
};
use pagetrace_transport::Transport;
use tokio::sync::mpsc;
use tracing::debug;

use crate::output::{
    config_json, header_json, print_config_human, print_event_human, print_header_human,
};
use crate::telemetry::init_cli_tracing;

#[derive(Parser, Debug)]
#[command(name = "pagetrace")]
#[command(about = "Page-load tracing and delivery utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Show the effective configuration")]
    Config,
    #[command(about = "Parse a sentry-trace header value")]
    ParseHeader { value: String },
    #[command(about = "Trace a simulated page load and deliver it")]
    Demo {
        #[arg(long, default_value = "/")]
        location: String,
        #[arg(long, help = "Incoming sentry-trace value to continue")]
        trace_header: Option<String>,
        #[arg(long, default_value_t = 3)]
        spans: usize,
        #[arg(long, default_value = "50ms")]
        span_duration: String,
        #[arg(long, help = "Overrides the configured idle timeout (e.g. 200ms)")]
        idle_timeout: Option<String>,
        #[arg(long, help = "Collector URL; overrides PAGETRACE_ENDPOINT")]
        endpoint: Option<String>,
        #[arg(long, help = "Print the transaction without sending it")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();

    match cli.command {
        Commands::Config => {
            let cfg = Config::load().context("load configuration")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config_json(&cfg))?);
            } else {
                print_config_human(&cfg);
            }
            Ok(())
        }
        Commands::ParseHeader { value } => {
            let header = TraceHeader::parse(&value)
                .with_context(|| format!("malformed trace header: {value:?}"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&header_json(&header))?);
            } else {
                print_header_human(&header);
            }
            Ok(())
        }
        Commands::Demo {
            location,
            trace_header,
            spans,
            span_duration,
            idle_timeout,
            endpoint,
            dry_run,
        } => {
            let mut cfg = Config::load().context("load configuration")?;
            if let Some(idle) = idle_timeout {
                cfg.idle_timeout = parse_duration_str(&idle)?;
            }
            if endpoint.is_some() {
                cfg.endpoint = endpoint;
            }
            cfg.normalize();
            run_demo(
                cfg,
                DemoPlan {
                    location,
                    trace_header,
                    spans,
                    span_duration: parse_duration_str(&span_duration)?,
                    dry_run,
                },
                cli.json,
            )
            .await
        }
    }
}

struct DemoPlan {
    location: String,
    trace_header: Option<String>,
    spans: usize,
    span_duration: Duration,
    dry_run: bool,
}

/// Forwards finished transactions to the demo driver.
struct ChannelSink(mpsc::UnboundedSender<TransactionEvent>);

impl TransactionSink for ChannelSink {
    fn capture(&self, event: TransactionEvent) {
        let _ = self.0.send(event);
    }
}

async fn run_demo(cfg: Config, plan: DemoPlan, json: bool) -> anyhow::Result<()> {
    let transport = if plan.dry_run {
        None
    } else {
        Some(
            Transport::from_config(&cfg)
                .context("an endpoint is required unless --dry-run is given")?,
        )
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tracer = Tracer::builder()
        .sampler(Sampler::rate(cfg.traces_sample_rate.unwrap_or(1.0)))
        .sink(Arc::new(ChannelSink(tx)))
        .max_spans(cfg.max_spans)
        .build();
    let router = RouteTracer::new(tracer, RouteTracerOptions::from_config(&cfg));

    let mut meta = HashMap::new();
    if let Some(header) = plan.trace_header {
        meta.insert(TRACE_HEADER_NAME.to_string(), header);
    }
    let Some(page_load) = router.start_page_load(&plan.location, &meta) else {
        anyhow::bail!("page load transactions are disabled by configuration");
    };
    if !page_load.sampled() {
        page_load.finish();
        println!("transaction {} was not sampled", page_load.trace_id());
        return Ok(());
    }

    for i in 0..plan.spans {
        let span = page_load.start_child(
            SpanContext::new("resource.fetch").with_description(format!("GET /assets/{i}")),
        );
        tokio::time::sleep(plan.span_duration).await;
        span.set_http_status(200);
        span.finish();
    }

    let wait = cfg.max_transaction_duration + Duration::from_secs(1);
    let event = tokio::time::timeout(wait, rx.recv())
        .await
        .context("page load never finished")?
        .context("tracer dropped before the page load finished")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&event)?);
    } else {
        print_event_human(&event);
    }

    let Some(transport) = transport else {
        return Ok(());
    };
    let options = transport.options();
    let status = transport
        .send_event(&event)
        .await
        .with_context(|| format!("deliver transaction to {}", options.endpoint))?;
    debug!(event_id = %event.event_id, %status, "demo transaction delivered");
    transport.close(options.request_timeout).await;
    if !json {
        println!("delivered status={status}");
    }
    Ok(())
}
