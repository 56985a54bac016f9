use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use studio_core::runtime::params::{CodeParams, ImageParams, TaskParameters};
use studio_core::{
    ArtifactMetadata, ArtifactRef, ArtifactStore, ExecutionError, Executor, ProgressReporter, TaskRecord,
};
use tracing::debug;

/// Stand-in for model-calling code: walks through progress steps, writes a
/// placeholder artifact per output and returns a result shaped like the real
/// generators' output.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    artifacts: Arc<dyn ArtifactStore>,
    step: Duration,
}

impl SimulatedExecutor {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, step: Duration) -> Self {
        Self { artifacts, step }
    }

    async fn save(
        &self,
        task: &TaskRecord,
        filename: &str,
        mime_type: &str,
        data: impl Into<Bytes>,
    ) -> Result<ArtifactRef, ExecutionError> {
        self.artifacts
            .store(
                data.into(),
                ArtifactMetadata {
                    filename: filename.to_owned(),
                    mime_type: mime_type.to_owned(),
                    user_id: task.user_id().to_owned(),
                    task_id: task.id(),
                    kind: task.kind(),
                },
            )
            .await
    }

    async fn render(&self, task: &TaskRecord) -> Result<Value, ExecutionError> {
        let prompt = task.prompt();
        let value = match task.parameters() {
            TaskParameters::Video(p) => {
                let clip = self
                    .save(task, "clip.mp4", "video/mp4", placeholder("video", prompt))
                    .await?;
                json!({
                    "type": "video",
                    "video_url": clip.url,
                    "duration": p.duration,
                    "format": "mp4",
                    "model_used": p.model,
                    "artifact": clip,
                    "metadata": { "prompt": prompt, "style": p.style },
                })
            }
            TaskParameters::Audio(p) => {
                let track = self
                    .save(task, "track.mp3", "audio/mpeg", placeholder("audio", prompt))
                    .await?;
                json!({
                    "type": "audio",
                    "audio_url": track.url,
                    "duration": p.duration,
                    "format": "mp3",
                    "model_used": p.model,
                    "artifact": track,
                    "metadata": { "prompt": prompt, "genre": p.genre },
                })
            }
            TaskParameters::Image(p) => self.render_images(task, p).await?,
            TaskParameters::Code(p) => {
                let code = sample_code(p, prompt);
                let file = self
                    .save(task, &format!("main.{}", source_extension(&p.language)), "text/plain", code.clone())
                    .await?;
                json!({
                    "type": "code",
                    "code": code,
                    "language": p.language,
                    "artifact": file,
                    "metadata": { "prompt": prompt },
                })
            }
            TaskParameters::Text(p) => {
                let text = format!("{prompt}\n\n(simulated completion from {})", p.model);
                let tokens_used = text.split_whitespace().count().min(p.max_tokens as usize);
                json!({
                    "type": "text",
                    "text": text,
                    "tokens_used": tokens_used,
                    "model_used": p.model,
                    "metadata": { "prompt": prompt },
                })
            }
        };
        Ok(value)
    }

    async fn render_images(&self, task: &TaskRecord, p: &ImageParams) -> Result<Value, ExecutionError> {
        let mut images = Vec::with_capacity(p.num_images as usize);
        for index in 0..p.num_images {
            let seed = format!("{} #{index} {}x{}", task.prompt(), p.width, p.height);
            images.push(
                self.save(task, "image.png", "image/png", placeholder("image", &seed))
                    .await?,
            );
        }
        let urls: Vec<&str> = images.iter().map(|a| a.url.as_str()).collect();
        Ok(json!({
            "type": "image",
            "image_url": urls.first(),
            "images": urls,
            "width": p.width,
            "height": p.height,
            "format": "png",
            "model_used": p.model,
            "artifacts": images,
            "metadata": { "prompt": task.prompt(), "negative_prompt": p.negative_prompt },
        }))
    }
}

fn placeholder(kind: &str, prompt: &str) -> Vec<u8> {
    format!("SIMULATED {kind}\n{prompt}\n").into_bytes()
}

fn source_extension(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "python" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "rust" => "rs",
        "go" => "go",
        _ => "txt",
    }
}

fn sample_code(params: &CodeParams, prompt: &str) -> String {
    let comment = match params.language.to_ascii_lowercase().as_str() {
        "python" => "#",
        _ => "//",
    };
    format!("{comment} {prompt}\n{comment} generated for {}\n", params.language)
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, task: &TaskRecord, progress: &ProgressReporter) -> Result<Value, ExecutionError> {
        let started = Instant::now();
        for percent in [20, 40, 60, 80] {
            tokio::time::sleep(self.step).await;
            progress.report(percent).await;
        }
        let mut value = self.render(task).await?;
        progress.report(100).await;

        let elapsed = started.elapsed().as_secs_f64();
        if let Some(map) = value.as_object_mut() {
            map.insert("generation_time".into(), json!(elapsed));
        }
        debug!(task_id = %task.id(), elapsed, "simulated generation finished");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::artifacts::LocalArtifactStore;
    use studio_core::{InMemoryTaskStore, SharedClock, SystemClock, TaskKind, TaskStore};

    #[tokio::test]
    async fn image_result_lists_every_image() {
        let root = std::env::temp_dir().join(format!("studio-sim-{}", uuid::Uuid::new_v4()));
        let executor = SimulatedExecutor::new(Arc::new(LocalArtifactStore::new(&root)), Duration::from_millis(1));
        let clock: SharedClock = Arc::new(SystemClock);
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let params = TaskParameters::parse(TaskKind::Image, json!({"num_images": 2})).unwrap();
        let task = TaskRecord::new(uuid::Uuid::new_v4(), "alice", "a cat", params, clock.now());
        let reporter = ProgressReporter::new(task.id(), store, clock);

        let result = executor.execute(&task, &reporter).await.unwrap();
        tokio::fs::remove_dir_all(&root).await.ok();

        assert_eq!(result["type"], "image");
        assert_eq!(result["images"].as_array().unwrap().len(), 2);
        assert!(result["image_url"].as_str().unwrap().starts_with("/storage/images/"));
        assert!(result["generation_time"].is_number());
    }

    #[test]
    fn code_uses_language_comment_style() {
        let rust = CodeParams {
            language: "rust".into(),
        };
        assert!(sample_code(&rust, "fizzbuzz").starts_with("// fizzbuzz"));
        assert_eq!(source_extension("Python"), "py");
    }
}
