#![forbid(unsafe_code)]

//! # twistedpair
//!
//! A distortion pedal for local LLMs. A captured piece of text (a *signal*)
//! is rewritten through one of six rhetorical modes, colored by one of five
//! tones, with a gain knob that maps linearly onto sampling temperature,
//! top-k and top-p. One signal can run through a single knob setting or an
//! ensemble of settings; results are braided into one summary and archived.
//!
//! Beyond one-shot distortion the crate carries multi-turn chat sessions
//! (persisted, idle-expiring, forkable) with token-budgeted context
//! assembly, and optional web enrichment: a search intent in the signal
//! triggers a Brave/DuckDuckGo search, a page fetch per hit, and the fetched
//! text is spliced into the signal before distortion.

pub mod agent;
pub mod archive;
pub mod chat;
pub mod config;
pub mod ensemble;
pub mod gateway;
pub mod pedal;
pub mod session;
pub mod types;
pub mod web;

pub use agent::{Agent, DEFAULT_MODEL};
pub use archive::{ArchiveError, RunArchive};
pub use chat::{ChatError, ChatService, ChatTurn};
pub use config::{ConfigError, Settings};
pub use ensemble::{
    braid, default_knob_sets, normalize_capture, process_signal, run_ensemble, Capture, RunRecord,
};
pub use gateway::{OllamaSampler, ProviderError, SampleRequest, SampleResponse, Sampler};
pub use pedal::{Pedal, PedalError, SamplingRanges};
pub use session::{ChatMessage, ChatSession, Role, SessionError, SessionStore};
pub use types::{AgentOutput, Knobs, Metadata, Mode, Prompt, Signal, Tone};
pub use web::{parse_web_intent, WebEnricher};
