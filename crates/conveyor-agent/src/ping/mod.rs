pub mod poll;
pub mod stream;

pub use poll::PollSource;
pub use stream::StreamSource;
