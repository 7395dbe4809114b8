use diesel::prelude::*;

#[derive(Queryable, Selectable, Identifiable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(primary_key(request_key))]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = crate::schema::response_cache)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CachedResponseDB {
    pub request_key: String,
    pub endpoint: String,
    pub status: i32,
    pub body: String,
    pub cached_at: i64,
    pub expires_at: Option<i64>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(primary_key(seq))]
#[diesel(table_name = crate::schema::request_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RequestQueueEntryDB {
    pub seq: i32,
    pub id: String,
    pub request_key: String,
    pub method: String,
    pub endpoint: String,
    pub body: Option<String>,
    pub enqueued_at: i64,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::request_queue)]
pub struct NewRequestQueueEntryDB {
    pub id: String,
    pub request_key: String,
    pub method: String,
    pub endpoint: String,
    pub body: Option<String>,
    pub enqueued_at: i64,
    pub status: String,
    pub retry_count: i32,
}
