pub mod agent;
pub mod chunk;
pub mod endpoint;
pub mod error;
pub mod job;
pub mod ping;

pub use agent::{AgentConfig, RegisteredAgent};
pub use chunk::{ChunkBuffer, LogChunk};
pub use endpoint::{Endpoint, EndpointState, HeaderNameError, header_name_from_env};
pub use error::{AgentError, ErrorKind};
pub use job::{InvalidTransition, Job, JobResult, JobState};
pub use ping::{JobRef, PingEvent};
