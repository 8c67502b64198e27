// Core building blocks shared by the storage port and the orchestrators.
pub mod codec;
pub mod error;
pub mod jobs;
pub mod naming;
pub mod pipe;
pub mod statements;
