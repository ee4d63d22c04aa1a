//! Logging and optional trace export for the `tokengate` binary.
//!
//! Logs go to stderr as pretty text or JSON lines (`--log-format`). Spans are also
//! exported over OTLP/gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, reported under
//! the crate name, version and git revision.

use anyhow::{Result, anyhow};
use base64ct::{Base64, Encoding};
use once_cell::sync::OnceCell;
use opentelemetry::{
    KeyValue, global,
    propagation::TextMapCompositePropagator,
    trace::TracerProvider as _,
};
use opentelemetry_otlp::{Compression, SpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, fmt, str::FromStr, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};
use ulid::Ulid;
use url::Url;

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

/// Exporter settings taken from the standard `OTEL_*` variables.
#[derive(Debug, PartialEq, Eq)]
struct ExporterSettings {
    endpoint: String,
    tls_domain: Option<String>,
    headers: Vec<(String, String)>,
    instance_id: String,
}

impl ExporterSettings {
    /// `None` when no endpoint is configured. Endpoints without a scheme use https.
    fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("OTEL_EXPORTER_OTLP_ENDPOINT")?;
        let raw = raw.trim().trim_end_matches('/');
        if raw.is_empty() {
            return None;
        }

        let endpoint = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        let tls_domain = Url::parse(&endpoint)
            .ok()
            .filter(|url| url.scheme() == "https")
            .and_then(|url| url.host_str().map(str::to_string));

        let headers = lookup("OTEL_EXPORTER_OTLP_HEADERS")
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default();
        let instance_id = lookup("OTEL_SERVICE_INSTANCE_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());

        Some(Self {
            endpoint,
            tls_domain,
            headers,
            instance_id,
        })
    }

    // Keys ending in "-bin" are binary metadata with base64 values.
    fn metadata(&self) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::with_capacity(self.headers.len());

        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if name.ends_with("-bin") {
                let bytes = Base64::decode_vec(value)
                    .map_err(|e| anyhow!("header {name}: value is not base64: {e}"))?;
                let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                    .map_err(|e| anyhow!("header {name}: {e}"))?;
                metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
            } else {
                let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                    .map_err(|e| anyhow!("header {name}: {e}"))?;
                let value: MetadataValue<Ascii> = value
                    .parse()
                    .map_err(|e| anyhow!("header {name}: {e}"))?;
                metadata.insert(key, value);
            }
        }

        Ok(metadata)
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(vec![
                KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.instance.id", self.instance_id.clone()),
                KeyValue::new("vcs.revision", crate::GIT_COMMIT_HASH),
            ])
            .build()
    }

    fn tracer(&self) -> Result<Tracer> {
        let mut builder = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.endpoint)
            .with_compression(Compression::Gzip)
            .with_timeout(EXPORT_TIMEOUT);

        if let Some(domain) = &self.tls_domain {
            builder = builder.with_tls_config(
                ClientTlsConfig::new()
                    .domain_name(domain.clone())
                    .with_native_roots(),
            );
        }
        if !self.headers.is_empty() {
            builder = builder.with_metadata(self.metadata()?);
        }

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(builder.build()?)
            .with_resource(self.resource())
            .build();

        let _ = TRACER_PROVIDER.set(provider.clone());
        global::set_tracer_provider(provider.clone());
        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]));

        Ok(provider.tracer(env!("CARGO_PKG_NAME")))
    }
}

// `k1=v1,k2=v2`; pairs without `=` or with an empty key are dropped.
fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn filter(level: Level) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("h2=error".parse()?)
        .add_directive("tonic=warn".parse()?)
        .add_directive("redis=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

/// Install the global subscriber. Without a verbosity only errors are logged.
///
/// # Errors
/// Returns an error if the exporter cannot be built or a subscriber is already set.
pub fn init(verbosity_level: Option<Level>, format: LogFormat) -> Result<()> {
    let filter = filter(verbosity_level.unwrap_or(Level::ERROR))?;

    let (pretty, json) = match format {
        LogFormat::Pretty => (
            Some(tracing_subscriber::fmt::layer().with_target(false).pretty()),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true),
            ),
        ),
    };

    let otel = match ExporterSettings::from_lookup(|name| var(name).ok()) {
        Some(settings) => Some(tracing_opentelemetry::layer().with_tracer(settings.tracer()?)),
        None => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(otel);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Flush and stop the exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("flushing trace exporter");
        let _ = provider.shutdown();
    }
}
