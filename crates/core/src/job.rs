//! Job specification, queue records and the generation stage machine.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::markup::{escape_markdown_v2, escape_markdown_v2_code};
use crate::modes::DEFAULT_MODE;
use crate::types::{MessageRef, Timestamp, UserId};

/// A fully resolved generation request.
///
/// Produced by [`crate::params::parse`]. The pipeline works on its own
/// copy and mutates `prompt` (templating, enhancement) and `seed`
/// (lazy randomisation) on that copy only.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub user_id: UserId,
    pub prompt: String,
    pub batch_size: u32,
    pub width: u32,
    pub height: u32,
    /// `Some` only when the user fixed the seed with `seed=N`.
    pub seed: Option<u64>,
    pub cfg: f64,
    pub steps: u32,
    pub lora: Option<String>,
    pub lora_strength: f64,
    pub sampler: String,
    pub scheduler: String,
    pub mode: String,
    pub prompt_enhance: Option<String>,
    pub prompt_template_pre_pe: String,
    pub prompt_template_post_pe: String,
}

impl JobSpec {
    /// Return the seed, drawing one from the full `u32` range first if
    /// the user did not fix it.
    pub fn resolve_seed(&mut self) -> u64 {
        *self
            .seed
            .get_or_insert_with(|| u64::from(rand::random::<u32>()))
    }

    /// Human-readable settings summary in MarkdownV2.
    ///
    /// Call after [`resolve_seed`](Self::resolve_seed); an unresolved
    /// seed is shown as `random`.
    pub fn describe(&self) -> String {
        let seed = self
            .seed
            .map_or_else(|| "random".to_string(), |s| s.to_string());
        let mut desc = format!(
            "Size: {}x{}\nSeed: `{}`\nGuidance: {}\nSteps: {}",
            self.width,
            self.height,
            escape_markdown_v2_code(&seed),
            escape_markdown_v2(&self.cfg.to_string()),
            self.steps,
        );
        if let Some(lora) = &self.lora {
            desc.push_str(&format!(
                "\nLora: `{}`\nLora strength: {}",
                escape_markdown_v2_code(lora),
                escape_markdown_v2(&self.lora_strength.to_string()),
            ));
        }
        if self.mode != DEFAULT_MODE {
            desc.push_str(&format!("\nMode: {}", escape_markdown_v2(&self.mode)));
        }
        desc
    }
}

/// One queued render: a [`JobSpec`] plus mutable queue state.
///
/// Shared between the queue worker (which drives it) and command
/// handlers (which cancel it), so the flags are atomics.
#[derive(Debug)]
pub struct JobRecord {
    id: u64,
    spec: JobSpec,
    origin: MessageRef,
    created_at: Timestamp,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl JobRecord {
    pub fn new(id: u64, spec: JobSpec, origin: MessageRef) -> Self {
        Self {
            id,
            spec,
            origin,
            created_at: chrono::Utc::now(),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Manager-assigned id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn user_id(&self) -> UserId {
        self.spec.user_id
    }

    /// The message that requested this job; replies go to its chat.
    pub fn origin(&self) -> MessageRef {
        self.origin
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Whether the engine has started executing this job.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Stages a job moves through inside the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Queued,
    Enhancing,
    Submitting,
    Streaming,
    Fetching,
    Reporting,
    Done,
    Cancelled,
    Failed,
}

impl JobStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobStage) -> bool {
        use JobStage::*;
        match (self, next) {
            (Queued, Enhancing | Submitting | Cancelled | Failed) => true,
            (Enhancing, Submitting | Cancelled | Failed) => true,
            (Submitting, Streaming | Failed) => true,
            (Streaming, Fetching | Cancelled | Failed) => true,
            (Fetching, Reporting | Cancelled | Failed) => true,
            (Reporting, Done | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            user_id: 5,
            prompt: "a cat".to_string(),
            batch_size: 1,
            width: 1024,
            height: 768,
            seed: None,
            cfg: 3.5,
            steps: 20,
            lora: None,
            lora_strength: 1.0,
            sampler: "euler".to_string(),
            scheduler: "simple".to_string(),
            mode: "default".to_string(),
            prompt_enhance: None,
            prompt_template_pre_pe: "{}".to_string(),
            prompt_template_post_pe: "{}".to_string(),
        }
    }

    #[test]
    fn fixed_seed_is_kept() {
        let mut spec = JobSpec {
            seed: Some(42),
            ..spec()
        };
        assert_eq!(spec.resolve_seed(), 42);
        assert_eq!(spec.seed, Some(42));
    }

    #[test]
    fn unset_seed_is_drawn_once() {
        let mut spec = spec();
        let first = spec.resolve_seed();
        assert!(first <= u64::from(u32::MAX));
        assert_eq!(spec.resolve_seed(), first);
    }

    #[test]
    fn describe_default_mode() {
        let spec = JobSpec {
            seed: Some(42),
            ..spec()
        };
        assert_eq!(
            spec.describe(),
            "Size: 1024x768\nSeed: `42`\nGuidance: 3\\.5\nSteps: 20"
        );
    }

    #[test]
    fn describe_lora_and_mode() {
        let spec = JobSpec {
            seed: Some(7),
            lora: Some("real_v2.safetensors".to_string()),
            lora_strength: 0.8,
            mode: "real".to_string(),
            ..spec()
        };
        let desc = spec.describe();
        assert!(desc.contains("\nLora: `real_v2.safetensors`"));
        assert!(desc.contains("\nLora strength: 0\\.8"));
        assert!(desc.ends_with("\nMode: real"));
    }

    #[test]
    fn record_flags_start_cleared() {
        let record = JobRecord::new(1, spec(), MessageRef::new(5, 10));
        assert!(!record.is_running());
        assert!(!record.is_cancelled());
        record.mark_running();
        record.cancel();
        assert!(record.is_running());
        assert!(record.is_cancelled());
    }

    #[test]
    fn stage_transitions() {
        assert!(JobStage::Queued.can_transition_to(JobStage::Enhancing));
        assert!(JobStage::Queued.can_transition_to(JobStage::Submitting));
        assert!(JobStage::Streaming.can_transition_to(JobStage::Cancelled));
        assert!(JobStage::Enhancing.can_transition_to(JobStage::Cancelled));
        assert!(!JobStage::Submitting.can_transition_to(JobStage::Cancelled));
        assert!(!JobStage::Done.can_transition_to(JobStage::Failed));
        assert!(JobStage::Failed.is_terminal());
        assert!(!JobStage::Fetching.is_terminal());
    }
}
