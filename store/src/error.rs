use kestrel_types::TaskState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("no task known for task-id {0}")]
    UnknownTask(String),

    #[error("invalid state transition for {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("invalid goal override transition for {0}")]
    InvalidOverrideTransition(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
