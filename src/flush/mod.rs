mod queue;

pub use queue::FlushQueue;
