//! Database schema for rivernode.db.

use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const DEVICE_TABLE_V1: Table = Table {
    name: "device",
    columns: &[
        Column::new("id", SqlType::Text).primary_key(),
        Column::new("name", SqlType::Text).non_null(),
        Column::new("operating_system", SqlType::Text).non_null(),
        Column::new("processor", SqlType::Text).non_null(),
        Column::new("memory_gb", SqlType::Real).non_null(),
        Column::new("version", SqlType::Text).non_null(),
        Column::new("status", SqlType::Text).non_null(),
        Column::new("form_status", SqlType::Text).non_null(),
        Column::new("message", SqlType::Text),
    ],
    indices: &[],
};

const SETTINGS_TABLE_V1: Table = Table {
    name: "settings",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("parse_dates_from_file", SqlType::Integer).non_null(),
        Column::new("video_file_fmt", SqlType::Text).non_null(),
        Column::new("allowed_dt", SqlType::Real).non_null(),
        Column::new("shutdown_after_task", SqlType::Integer).non_null(),
        Column::new("reboot_after", SqlType::Real).non_null(),
    ],
    indices: &[],
};

const DISK_MANAGEMENT_TABLE_V1: Table = Table {
    name: "disk_management",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("home_folder", SqlType::Text).non_null(),
        Column::new("min_free_space", SqlType::Real).non_null(),
        Column::new("critical_space", SqlType::Real).non_null(),
        Column::new("frequency", SqlType::Integer).non_null(),
    ],
    indices: &[],
};

const WATER_LEVEL_SETTINGS_TABLE_V1: Table = Table {
    name: "water_level_settings",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("datetime_fmt", SqlType::Text).non_null(),
        Column::new("file_template", SqlType::Text).non_null(),
        Column::new("frequency", SqlType::Real).non_null(),
        Column::new("script_type", SqlType::Text).non_null(),
        Column::new("script", SqlType::Text).non_null(),
        Column::new("optical", SqlType::Integer).non_null().default_value("0"),
    ],
    indices: &[],
};

const WATER_LEVEL_READINGS_TABLE_V1: Table = Table {
    name: "water_level_readings",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("timestamp", SqlType::Integer).non_null().unique(),
        Column::new("level", SqlType::Real).non_null(),
        Column::new("q_05", SqlType::Real),
        Column::new("q_25", SqlType::Real),
        Column::new("q_50", SqlType::Real),
        Column::new("q_75", SqlType::Real),
        Column::new("q_95", SqlType::Real),
        Column::new("fraction_velocimetry", SqlType::Real),
    ],
    indices: &[("idx_readings_timestamp", "timestamp")],
};

const TASK_FORMS_TABLE_V1: Table = Table {
    name: "task_forms",
    columns: &[
        Column::new("id", SqlType::Text).primary_key(),
        Column::new("created_at", SqlType::Integer).non_null(),
        Column::new("status", SqlType::Text).non_null(),
        Column::new("task_body", SqlType::Text).non_null(),
        Column::new("message", SqlType::Text),
    ],
    indices: &[("idx_task_forms_status", "status")],
};

const VIDEOS_TABLE_V1: Table = Table {
    name: "videos",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("timestamp", SqlType::Integer).non_null(),
        Column::new("status", SqlType::Text).non_null(),
        Column::new("file_name", SqlType::Text).non_null(),
        Column::new("image_name", SqlType::Text),
        Column::new("water_level", SqlType::Real),
        Column::new("sync_status", SqlType::Integer).non_null().default_value("0"),
    ],
    indices: &[("idx_videos_status", "status")],
};

const PENDING_CALLBACKS_TABLE_V1: Table = Table {
    name: "pending_callbacks",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("created_at", SqlType::Integer).non_null(),
        Column::new("body", SqlType::Text).non_null(),
    ],
    indices: &[("idx_pending_callbacks_created_at", "created_at")],
};

const CALLBACK_URL_TABLE_V1: Table = Table {
    name: "callback_url",
    columns: &[
        Column::new("id", SqlType::Integer).primary_key(),
        Column::new("url", SqlType::Text).non_null(),
        Column::new("token_refresh_endpoint", SqlType::Text),
        Column::new("access_token", SqlType::Text),
        Column::new("refresh_token", SqlType::Text),
        Column::new("expires_at", SqlType::Integer),
    ],
    indices: &[],
};

pub const NODE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        DEVICE_TABLE_V1,
        SETTINGS_TABLE_V1,
        DISK_MANAGEMENT_TABLE_V1,
        WATER_LEVEL_SETTINGS_TABLE_V1,
        WATER_LEVEL_READINGS_TABLE_V1,
        TASK_FORMS_TABLE_V1,
        VIDEOS_TABLE_V1,
        PENDING_CALLBACKS_TABLE_V1,
        CALLBACK_URL_TABLE_V1,
    ],
    migration: None,
}];
