//! specdec-core: the accelerator-facing core of a speculative-decoding
//! inference engine — paged KV cache, rejection-sampling verification, and
//! an adaptive controller that keeps speculation depth tracking the
//! draft/target acceptance rate.
//!
//! This crate has no HTTP surface, no CLI, and no device backend of its
//! own: it is the library a serving layer embeds, given two
//! [`model::LanguageModel`] implementations (draft and target) and a
//! [`config::Config`].
//!
//! ```text
//! block        — C1 (BlockPool) + C2 (SequencePageTable): the allocator
//! cache        — C3 (PagedKvCache) + C4 (CachedModelAdapter)
//! model        — the LanguageModel seam a serving layer implements
//! tokenizer    — the Tokenizer seam a serving layer implements
//! speculative  — C5: rejection-sampling verification, model-agnostic
//! controller   — C7: adaptive speculation depth
//! generation   — C6 (GenerationLoop) + C8 (GenerationStream)
//! config       — on-disk configuration and validation
//! error        — the crate's error taxonomy
//! ```

pub mod block;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod generation;
pub mod model;
pub mod speculative;
pub mod tokenizer;

pub use block::{BlockPool, BlockShape, Device, SequencePageTable};
pub use cache::{CachedKv, CachedModelAdapter, LaneId, PagedKvCache};
pub use config::Config;
pub use controller::AdaptiveController;
pub use error::{CoreError, CoreResult};
pub use generation::{Event, FinalReason, FinalSummary, GenerationLoop, GenerationResult, GenerationStream};
pub use model::LanguageModel;
pub use speculative::{verify_step, StepVerification};
pub use tokenizer::Tokenizer;
