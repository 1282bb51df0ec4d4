// ABOUTME: Structured logging setup for the Parley server
// ABOUTME: Builds the tracing subscriber from environment settings with json, pretty, or compact output
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Logging configuration with structured output

use std::env;
use std::fmt;
use std::io;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::constants::service_names;

/// Dependencies that are chatty at debug level
const NOISE_DIRECTIVES: &[&str] = &[
    "hyper=warn",
    "hyper_util=warn",
    "h2=warn",
    "reqwest=warn",
    "rustls=warn",
    "sqlx=warn",
    "tower_http=info",
];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => Self::Json,
            Some("compact") => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub include_spans: bool,
    /// Include source file and line
    pub include_location: bool,
    /// Service name attached to the startup record
    pub service_name: String,
    /// Deployment environment
    pub environment: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            include_spans: false,
            include_location: false,
            service_name: service_names::PARLEY_SERVER.into(),
            environment: "development".into(),
        }
    }
}

impl LoggingConfig {
    /// Read `RUST_LOG`, `LOG_FORMAT`, `ENVIRONMENT`, `SERVICE_NAME`,
    /// `LOG_INCLUDE_SPANS`, and `LOG_INCLUDE_LOCATION`
    #[must_use]
    pub fn from_env() -> Self {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());
        let is_production = environment == "production";
        let format = LogFormat::from_env_value(env::var("LOG_FORMAT").ok().as_deref());

        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            // Production defaults to JSON unless a format was requested
            format: if is_production && env::var("LOG_FORMAT").is_err() {
                LogFormat::Json
            } else {
                format
            },
            include_spans: env::var("LOG_INCLUDE_SPANS").is_ok(),
            include_location: is_production || env::var("LOG_INCLUDE_LOCATION").is_ok(),
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| service_names::PARLEY_SERVER.into()),
            environment,
        }
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .with_context(|| format!("Invalid log filter '{}'", self.level))?;
        for directive in NOISE_DIRECTIVES {
            let directive: Directive = directive
                .parse()
                .with_context(|| format!("Invalid noise directive '{directive}'"))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }

    /// Install the global subscriber
    ///
    /// # Errors
    ///
    /// Fails on an invalid filter or when a global subscriber is already set.
    pub fn init(&self) -> Result<()> {
        let registry = tracing_subscriber::registry().with(self.filter()?);
        let span_events = if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let installed = match self.format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_file(self.include_location)
                        .with_line_number(self.include_location)
                        .with_span_events(span_events)
                        .with_writer(io::stdout),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_file(self.include_location)
                        .with_line_number(self.include_location)
                        .with_span_events(span_events)
                        .with_writer(io::stdout),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(io::stdout),
                )
                .try_init(),
        };
        installed.context("Failed to install tracing subscriber")?;

        info!(
            service.name = %self.service_name,
            service.version = env!("CARGO_PKG_VERSION"),
            environment = %self.environment,
            log.level = %self.level,
            log.format = %self.format,
            "Logging initialized"
        );
        Ok(())
    }
}
