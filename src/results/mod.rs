//! Durable case status and session records

mod storage;

pub use storage::{
    export_csv, generate_session_id, EnvironmentInfo, JsonStatusStore, MemoryStatusStore,
    SessionRecord, StatusStore,
};
