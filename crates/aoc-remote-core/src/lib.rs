pub mod model;
pub mod protocol;

pub use model::{
    new_project_id, new_session_id, MessageDirection, ProjectMetadata, ProjectState,
    TimestampedMessage,
};
