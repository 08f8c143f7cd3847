pub mod arbiter;
pub mod backend;
pub mod crossfade;
pub mod effects;
pub mod generation;
pub mod hooks;
pub mod mixer;
pub mod resolver;
mod supervisor;
