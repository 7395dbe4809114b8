use uuid::Uuid;

/// Random id for a new record.
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// Time-ordered id for queue entries, so ids sort roughly by enqueue time.
pub fn new_entry_id() -> String {
    Uuid::now_v7().to_string()
}
