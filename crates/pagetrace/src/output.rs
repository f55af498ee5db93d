use std::collections::HashMap;

use humantime::format_duration;
use owo_colors::OwoColorize;
use pagetrace_core::config::Config;
use pagetrace_core::model::{SpanRecord, TransactionEvent};
use pagetrace_core::status::SpanStatus;
use pagetrace_core::trace_header::TraceHeader;
use serde_json::{Value, json};

pub fn config_json(cfg: &Config) -> Value {
    json!({
        "endpoint": cfg.endpoint,
        "headers": cfg.headers.iter().map(|(k, _)| k).collect::<Vec<_>>(),
        "request_timeout": format_duration(cfg.request_timeout).to_string(),
        "traces_sample_rate": cfg.traces_sample_rate,
        "idle_timeout": format_duration(cfg.idle_timeout).to_string(),
        "max_transaction_duration": format_duration(cfg.max_transaction_duration).to_string(),
        "heartbeat_interval": format_duration(cfg.heartbeat_interval).to_string(),
        "max_spans": cfg.max_spans,
        "transport_buffer_size": cfg.transport_buffer_size,
        "default_retry_after": format_duration(cfg.default_retry_after).to_string(),
        "tracing_origins": cfg.tracing_origins,
        "start_transaction_on_page_load": cfg.start_transaction_on_page_load,
        "start_transaction_on_location_change": cfg.start_transaction_on_location_change,
        "mark_background_transactions": cfg.mark_background_transactions,
    })
}

pub fn print_config_human(cfg: &Config) {
    if let Value::Object(fields) = config_json(cfg) {
        for (key, value) in fields {
            let rendered = match value {
                Value::String(s) => s,
                Value::Null => "-".to_string(),
                other => other.to_string(),
            };
            println!("{key}={rendered}");
        }
    }
}

pub fn header_json(header: &TraceHeader) -> Value {
    json!({
        "trace_id": header.trace_id,
        "parent_span_id": header.parent_span_id,
        "sampled": header.parent_sampled,
    })
}

pub fn print_header_human(header: &TraceHeader) {
    println!("trace_id={}", header.trace_id);
    println!("parent_span_id={}", header.parent_span_id);
    match header.parent_sampled {
        Some(sampled) => println!("sampled={sampled}"),
        None => println!("sampled=-"),
    }
}

pub fn print_event_human(event: &TransactionEvent) {
    let trace = &event.contexts.trace;
    println!(
        "TRANSACTION {} op={} trace={} duration={:.0}ms spans={} status={}",
        event.transaction.bold(),
        trace.op,
        trace.trace_id,
        event.duration_ms(),
        event.spans.len(),
        status_label(trace.status)
    );
    for (key, value) in &event.tags {
        println!("  tag {key}={value}");
    }

    let mut children: HashMap<&str, Vec<&SpanRecord>> = HashMap::new();
    for span in &event.spans {
        let parent = span
            .parent_span_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or(trace.span_id.as_str());
        children.entry(parent).or_default().push(span);
    }
    print_children(trace.span_id.as_str(), &children, 1);
}

fn print_children(parent: &str, children: &HashMap<&str, Vec<&SpanRecord>>, depth: usize) {
    let Some(kids) = children.get(parent) else {
        return;
    };
    for span in kids {
        println!(
            "{}{} {} ({:.0}ms) {}",
            "  ".repeat(depth),
            span.op.cyan(),
            span.description.as_deref().unwrap_or("-"),
            span.duration_ms().unwrap_or(0.0),
            status_label(span.status)
        );
        print_children(span.span_id.as_str(), children, depth + 1);
    }
}

fn status_label(status: Option<SpanStatus>) -> String {
    match status {
        None => "-".to_string(),
        Some(SpanStatus::Ok) => "ok".green().to_string(),
        Some(SpanStatus::Cancelled) => "cancelled".yellow().to_string(),
        Some(other) => other.as_str().red().to_string(),
    }
}
