// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use opentelemetry::global;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;

/// Initializes the OpenTelemetry metrics provider.
///
/// With an OTLP endpoint configured, metrics export on a periodic reader;
/// otherwise a local-only provider keeps instrument creation cheap and
/// side-effect free.
///
/// # Errors
///
/// Returns an error if the OTLP exporter fails to build.
pub fn init_metrics(
    otlp_endpoint: Option<&str>,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    let resource = Resource::builder_empty()
        .with_attributes([
            opentelemetry::KeyValue::new("service.name", "streamscribe"),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let builder = SdkMeterProvider::builder().with_resource(resource);

    let provider = if let Some(endpoint) = otlp_endpoint {
        tracing::info!(endpoint, "Configuring OTLP metrics exporter");
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_secs(10))
            .build()?;
        let reader =
            PeriodicReader::builder(exporter).with_interval(Duration::from_secs(5)).build();
        builder.with_reader(reader).build()
    } else {
        tracing::info!("No OTLP endpoint configured, metrics will be collected but not exported");
        builder.build()
    };

    global::set_meter_provider(provider.clone());
    Ok(provider)
}
