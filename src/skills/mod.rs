pub mod executor;
pub mod loader;
pub mod registry;

pub use executor::{ExecOutcome, SkillExecutor};
pub use loader::{ActionSpec, ParamSpec, Skill, SkillMetadata};
pub use registry::{SkillRegistry, SkillSnapshot};
