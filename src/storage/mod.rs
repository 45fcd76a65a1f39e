// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: the Redis cache, the SQL store of record, and in-memory
//! versions of both.

pub mod traits;
pub mod redis;
pub mod sql;
pub mod memory;
