//! Image generation for memory blocks
//!
//! An independent sweep looks for blocks that have an image prompt but no
//! image yet, asks the generator for one and stores the returned URL. It
//! shares nothing with the consolidation worker except the store.

#[cfg(feature = "openai")]
mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAIImageGenerator;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Result, ReverieError};
use crate::storage::MemoryStore;
use crate::types::ImageConfig;

/// Turn a prompt into a hosted image URL
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Create an image generator from configuration, `None` when disabled
pub fn create_image_generator(config: &ImageConfig) -> Result<Option<Arc<dyn ImageGenerator>>> {
    if !config.enabled {
        return Ok(None);
    }
    build_generator(config).map(Some)
}

#[cfg(feature = "openai")]
fn build_generator(config: &ImageConfig) -> Result<Arc<dyn ImageGenerator>> {
    let api_key = config.api_key.clone().ok_or_else(|| {
        ReverieError::Config("REVERIE_IMAGE_API_KEY required for image generation".to_string())
    })?;
    Ok(Arc::new(OpenAIImageGenerator::from_config(api_key, config)))
}

#[cfg(not(feature = "openai"))]
fn build_generator(_config: &ImageConfig) -> Result<Arc<dyn ImageGenerator>> {
    Err(ReverieError::Config(
        "Image generation requires the 'openai' feature. Build with: cargo build --features openai"
            .to_string(),
    ))
}

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Generate missing images for every block in the store.
///
/// Blocks with an image or without a prompt are skipped. A failure on one
/// block is logged and does not stop the sweep; only failing to list the
/// blocks fails the sweep itself.
pub async fn run_image_sweep(
    store: &dyn MemoryStore,
    generator: &dyn ImageGenerator,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for block in store.get_memories()? {
        let prompt = block.content.image_prompt.trim().to_string();
        if block.image_url.is_some() || prompt.is_empty() {
            report.skipped += 1;
            continue;
        }

        tracing::info!(id = %block.id, topic = %block.content.topic, "generating image");
        // The block may be reconciled while the image is generated, so only
        // the image column is written back
        let stored = match generator.generate(&prompt).await {
            Ok(url) => store.set_image_url(&block.id, &url),
            Err(e) => Err(e),
        };

        match stored {
            Ok(()) => report.generated += 1,
            Err(e) => {
                tracing::warn!(id = %block.id, error = %e, "image generation failed");
                report.failed += 1;
            }
        }
    }

    if report.generated > 0 || report.failed > 0 {
        tracing::info!(
            generated = report.generated,
            failed = report.failed,
            "image sweep finished"
        );
    }
    Ok(report)
}

/// Runs sweeps one at a time, whether triggered by the timer or by hand
pub struct ImageSweeper {
    store: Arc<dyn MemoryStore>,
    generator: Arc<dyn ImageGenerator>,
    running: Mutex<()>,
}

impl ImageSweeper {
    pub fn new(store: Arc<dyn MemoryStore>, generator: Arc<dyn ImageGenerator>) -> Self {
        Self {
            store,
            generator,
            running: Mutex::new(()),
        }
    }

    /// Run a sweep, waiting for one already in progress
    pub async fn sweep(&self) -> Result<SweepReport> {
        let _running = self.running.lock().await;
        run_image_sweep(self.store.as_ref(), self.generator.as_ref()).await
    }

    /// Sweep on a fixed interval until the task is aborted
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!("Image sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReconciliationEngine;
    use crate::storage::Storage;
    use crate::types::{MemoryBlockContent, MemoryUpdate};
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    /// Fails for prompts containing "fail", otherwise echoes a URL
    struct FakeGenerator {
        prompts: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            if prompt.contains("fail") {
                return Err(ReverieError::Completion("content policy".into()));
            }
            Ok(format!("https://images.test/{}.png", prompt.len()))
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    fn content(prompt: &str) -> MemoryBlockContent {
        serde_json::from_value(json!({
            "topic": "trip",
            "sentences": ["we leave friday"],
            "dalle_prompt": prompt
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_skips_and_isolates() {
        let storage = Storage::open_in_memory().unwrap();
        let ready = storage.create_memory(&content("a coastal road"), "2025-01-23 10-00-00").unwrap();
        storage.create_memory(&content(""), "2025-01-23 10-00-01").unwrap();
        storage.create_memory(&content("please fail"), "2025-01-23 10-00-02").unwrap();
        let done = storage.create_memory(&content("a tent"), "2025-01-23 10-00-03").unwrap();
        storage.set_image_url(&done, "https://cdn.test/tent.png").unwrap();

        let generator = FakeGenerator {
            prompts: SyncMutex::new(Vec::new()),
        };
        let report = run_image_sweep(&storage, &generator).await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                generated: 1,
                skipped: 2,
                failed: 1
            }
        );
        assert_eq!(generator.prompts.lock().len(), 2);
        let block = storage.get_memory(&ready).unwrap().unwrap();
        assert_eq!(block.image_url.as_deref(), Some("https://images.test/14.png"));

        // second sweep has nothing new to do except retry the failure
        let report = run_image_sweep(&storage, &generator).await.unwrap();
        assert_eq!(report.generated, 0);
        assert_eq!(report.failed, 1);
    }

    /// Reconciles an update into the block while its image is generated
    struct ReconcilingGenerator {
        engine: ReconciliationEngine,
        memory_id: String,
    }

    #[async_trait]
    impl ImageGenerator for ReconcilingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            let mut update = content("a coastal road");
            update.sentences = vec!["bring the tent".into()];
            self.engine.apply_update(MemoryUpdate::Update {
                memory_id: self.memory_id.clone(),
                content: update,
            })?;
            Ok("https://images.test/road.png".into())
        }

        fn model_name(&self) -> &str {
            "reconciling"
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_updates_made_during_generation() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let id = storage
            .create_memory(&content("a coastal road"), "2025-01-23 10-00-00")
            .unwrap();
        let generator = ReconcilingGenerator {
            engine: ReconciliationEngine::new(storage.clone()),
            memory_id: id.clone(),
        };

        let report = run_image_sweep(storage.as_ref(), &generator).await.unwrap();
        assert_eq!(report.generated, 1);

        let block = storage.get_memory(&id).unwrap().unwrap();
        assert_eq!(block.content.sentences, vec!["we leave friday", "bring the tent"]);
        assert!(block.last_updated.is_some());
        assert_eq!(block.image_url.as_deref(), Some("https://images.test/road.png"));
    }

    #[tokio::test]
    async fn test_sweeper_runs_on_demand() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.create_memory(&content("a lighthouse"), "2025-01-23 10-00-00").unwrap();
        let sweeper = ImageSweeper::new(
            storage.clone(),
            Arc::new(FakeGenerator {
                prompts: SyncMutex::new(Vec::new()),
            }),
        );

        assert_eq!(sweeper.sweep().await.unwrap().generated, 1);
        assert_eq!(sweeper.sweep().await.unwrap().skipped, 1);
    }

    #[test]
    fn test_disabled_config_has_no_generator() {
        assert!(create_image_generator(&ImageConfig::default()).unwrap().is_none());
    }

    #[cfg(feature = "openai")]
    #[test]
    fn test_enabled_config_requires_key() {
        let config = ImageConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(create_image_generator(&config).is_err());
    }
}
