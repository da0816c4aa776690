use crate::archive::{ArchiveError, HttpBlobStore, KeyFormatter};
use crate::config::Config;
use crate::delivery::HttpLogSink;
use crate::destination::{
    key_namer, ArchiveDestination, ArchiveSettings, DestinationError, LogDestination,
    LogDestinationSettings,
};
use crate::storage::DuckDbLogStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Every running output of the process, by configured name.
///
/// Built once at startup and passed to whoever produces log lines.
#[derive(Default)]
pub struct Registry {
    destinations: BTreeMap<String, LogDestination>,
    archives: BTreeMap<String, ArchiveDestination>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every store and start every output in `config`. Outputs started
    /// before a failure are shut down again.
    pub async fn from_config(config: &Config) -> Result<Self, DestinationError> {
        let mut registry = Self::new();
        match registry.start_all(config).await {
            Ok(()) => Ok(registry),
            Err(e) => {
                registry.shutdown().await;
                Err(e)
            }
        }
    }

    async fn start_all(&mut self, config: &Config) -> Result<(), DestinationError> {
        let destinations: BTreeMap<_, _> = config.destinations.iter().collect();
        for (name, destination) in destinations {
            info!(destination = %name, store = %destination.store_path.display(), "Opening log store");
            let store = Arc::new(DuckDbLogStore::new(&destination.store_path)?);
            let sink = Arc::new(HttpLogSink::new(
                &destination.endpoint,
                Duration::from_secs(destination.request_timeout_seconds),
            )?);

            let settings = LogDestinationSettings::from_config(destination);
            let started = LogDestination::start(name, settings, store, sink).await?;
            self.add_destination(started).await;
        }

        let archives: BTreeMap<_, _> = config.archives.iter().collect();
        for (name, archive) in archives {
            let blob = HttpBlobStore::new(
                &archive.endpoint,
                &archive.bucket,
                Duration::from_secs(archive.request_timeout_seconds),
            )
            .map_err(ArchiveError::from)?;
            let formatter = KeyFormatter::new(&archive.key_pattern).map_err(ArchiveError::from)?;

            let started = ArchiveDestination::start(
                name,
                ArchiveSettings::from_config(archive),
                Arc::new(blob),
                key_namer(formatter),
            )?;
            self.add_archive(started).await;
        }

        Ok(())
    }

    /// Register a destination, shutting down any previous one of that name.
    /// This is how a destination moves to another group or stream: the new
    /// one starts without a sequence token.
    pub async fn add_destination(&mut self, destination: LogDestination) {
        if let Some(previous) = self
            .destinations
            .insert(destination.name().to_string(), destination)
        {
            previous.shutdown().await;
        }
    }

    pub async fn add_archive(&mut self, archive: ArchiveDestination) {
        if let Some(previous) = self.archives.insert(archive.name().to_string(), archive) {
            previous.shutdown().await;
        }
    }

    pub fn destination(&self, name: &str) -> Option<&LogDestination> {
        self.destinations.get(name)
    }

    pub fn archive(&self, name: &str) -> Option<&ArchiveDestination> {
        self.archives.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty() && self.archives.is_empty()
    }

    /// Hand one line to every output. Returns how many accepted it.
    pub fn write_all(&self, line: &str, timestamp: DateTime<Utc>) -> usize {
        let mut accepted = 0;

        for (name, destination) in &self.destinations {
            match destination.write(line, timestamp) {
                Ok(()) => accepted += 1,
                Err(e) => warn!(destination = %name, error = %e, "Dropping log line"),
            }
        }

        for (name, archive) in &self.archives {
            match archive.write_line(line) {
                Ok(_) => accepted += 1,
                Err(e) => warn!(archive = %name, error = %e, "Failed to write log line"),
            }
        }

        accepted
    }

    pub async fn shutdown(self) {
        let destinations = self.destinations.into_values().map(|d| d.shutdown());
        let archives = self.archives.into_values().map(|a| a.shutdown());

        futures::future::join_all(destinations).await;
        futures::future::join_all(archives).await;
    }
}
