use super::{Config, Error};
use crate::region::{Config as RegionConfig, Region};
use commonware_codec::Codec;
use commonware_runtime::{Clock, Error as RError, Handle, Metrics, Spawner, Storage};
use commonware_utils::Array;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One opened region and its background persistence task.
struct Entry<E, K, V>
where
    E: Storage + Metrics + Clock + Spawner,
    K: Array,
    V: Codec + Send + Sync + 'static,
    V::Cfg: Send + Sync,
{
    region: Arc<Region<E, K, V>>,
    persister: Option<Handle<()>>,
}

/// Implementation of `Registry` storage.
pub struct Registry<E, K, V>
where
    E: Storage + Metrics + Clock + Spawner,
    K: Array,
    V: Codec + Send + Sync + 'static,
    V::Cfg: Clone + Send + Sync,
{
    context: E,
    cfg: Config<V::Cfg>,
    regions: HashMap<String, Entry<E, K, V>>,
}

impl<E, K, V> Registry<E, K, V>
where
    E: Storage + Metrics + Clock + Spawner,
    K: Array,
    V: Codec + Send + Sync + 'static,
    V::Cfg: Clone + Send + Sync,
{
    /// Create an empty registry.
    pub fn new(context: E, cfg: Config<V::Cfg>) -> Self {
        Self {
            context,
            cfg,
            regions: HashMap::new(),
        }
    }

    /// Return the region registered under `name`, initializing it first if
    /// needed.
    ///
    /// A newly opened region gets a background task that persists its key
    /// index at the configured interval (if any).
    pub async fn open(&mut self, name: &str) -> Result<Arc<Region<E, K, V>>, Error> {
        if let Some(entry) = self.regions.get(name) {
            return Ok(entry.region.clone());
        }

        // Derive a partition name the runtime accepts
        let partition = sanitize(&format!("{}_{}", self.cfg.partition_prefix, name));
        let region = Arc::new(
            Region::init(
                self.context.with_label(&partition),
                RegionConfig {
                    partition,
                    block_size: self.cfg.block_size,
                    bound: self.cfg.bound,
                    codec_config: self.cfg.codec_config.clone(),
                    compression: self.cfg.compression,
                },
            )
            .await?,
        );

        // Schedule periodic key persistence
        let persister = self.cfg.persist_interval.map(|interval| {
            let region = region.clone();
            self.context
                .with_label("persister")
                .spawn(move |context| async move {
                    loop {
                        context.sleep(interval).await;
                        if let Err(err) = region.persist().await {
                            warn!(?err, "failed to persist keys");
                        }
                    }
                })
        });

        debug!(region = name, "opened region");
        self.regions.insert(
            name.to_string(),
            Entry {
                region: region.clone(),
                persister,
            },
        );
        Ok(region)
    }

    /// Names of all open regions.
    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    /// Dispose the region registered under `name`, returning whether it was
    /// open.
    ///
    /// The persistence task is cancelled and disposal runs on its own task
    /// bounded by the configured timeout, so a stuck region cannot hang
    /// shutdown: if the bound elapses, the registry proceeds and the task
    /// finishes (or is aborted) in the background.
    pub async fn dispose(&mut self, name: &str) -> Result<bool, Error> {
        let Some(entry) = self.regions.remove(name) else {
            return Ok(false);
        };
        if let Some(persister) = entry.persister {
            persister.abort();
        }

        let region = entry.region;
        let handle = self
            .context
            .with_label("disposer")
            .spawn(move |_| async move {
                if let Err(err) = region.dispose().await {
                    warn!(?err, "failed to dispose region");
                }
            });
        if let Err(RError::Timeout) = self.context.timeout(self.cfg.dispose_timeout, handle).await
        {
            warn!(region = name, "disposal timed out; proceeding");
        }
        debug!(region = name, "disposed region");
        Ok(true)
    }

    /// Dispose every open region (the shutdown hook).
    pub async fn dispose_all(&mut self) -> Result<(), Error> {
        let names: Vec<String> = self.regions.keys().cloned().collect();
        for name in names {
            self.dispose(&name).await?;
        }
        Ok(())
    }
}

/// Replace any byte the runtime rejects in partition names with an
/// underscore.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
