//! Logging setup.
//!
//! Many metadata servers feed one aggregated log stream, so every line
//! leads with a node tag identifying where it came from (the hostname,
//! plus the server id when one is known) and is written without ANSI
//! colors.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Plain event formatter that prefixes every line with a node tag.
pub struct NodeFormatter {
    node_tag: String,
}

impl NodeFormatter {
    /// Tag lines with the local hostname only.
    pub fn new() -> Self {
        Self::with_server(None)
    }

    /// Tag lines with `hostname/srvN`, for multi-server deployments where
    /// several daemons may share a host.
    pub fn for_server(srv_id: u32) -> Self {
        Self::with_server(Some(srv_id))
    }

    fn with_server(srv_id: Option<u32>) -> Self {
        let mut node_tag = gethostname::gethostname().to_string_lossy().into_owned();
        if node_tag.is_empty() {
            node_tag.push_str("unknown");
        }
        if let Some(srv_id) = srv_id {
            node_tag.push_str(&format!("/srv{srv_id}"));
        }
        Self { node_tag }
    }
}

impl Default for NodeFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for NodeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let now: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();
        write!(
            writer,
            "[{}] {} {:5} {}: ",
            self.node_tag,
            now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level(),
            meta.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn init_with(level: &str, formatter: NodeFormatter) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(formatter)
        .with_writer(std::io::stdout);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Initialize tracing. `RUST_LOG` overrides `level`.
pub fn init(level: &str) {
    init_with(level, NodeFormatter::new());
}

/// Initialize tracing for a server daemon, tagging lines with its id.
pub fn init_for_server(level: &str, srv_id: u32) {
    init_with(level, NodeFormatter::for_server(srv_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_tag_includes_server_id() {
        let plain = NodeFormatter::new();
        assert!(!plain.node_tag.is_empty());
        assert!(!plain.node_tag.contains("/srv"));

        let tagged = NodeFormatter::for_server(3);
        assert!(tagged.node_tag.ends_with("/srv3"));
        assert!(tagged.node_tag.starts_with(&plain.node_tag));
    }
}
