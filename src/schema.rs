// Diesel schema definitions.
// Must stay in sync with repository/schema_sqlite.sql and repository/schema_postgres.sql.

diesel::table! {
    work_items (id) {
        id -> Integer,
        sequence_number -> BigInt,
        original_name -> Text,
        storage_path -> Text,
        edited_path -> Nullable<Text>,
        mime_type -> Text,
        size_bytes -> BigInt,
        is_reviewed -> Bool,
        processed -> Bool,
        processed_at -> Nullable<Text>,
        in_flight -> Bool,
        claimed_at -> Nullable<Text>,
        claimed_by -> Nullable<Text>,
        failure_count -> Integer,
        last_error -> Nullable<Text>,
        extracted_text -> Nullable<Text>,
        is_bookmark -> Bool,
        group_id -> Nullable<Integer>,
        position_in_group -> Nullable<Integer>,
        consumed_at -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    page_groups (id) {
        id -> Integer,
        is_complete -> Bool,
        page_count -> Integer,
        created_at -> Text,
        completed_at -> Nullable<Text>,
    }
}

diesel::table! {
    advisory_locks (lock_key) {
        lock_key -> BigInt,
        acquired_at -> Text,
    }
}

diesel::joinable!(work_items -> page_groups (group_id));

diesel::allow_tables_to_appear_in_same_query!(work_items, page_groups, advisory_locks,);
