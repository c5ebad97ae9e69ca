//! Shared database mapping utilities
//!
//! SQLite 只有 TEXT/INTEGER/REAL，枚举与嵌套结构在这里统一转换。

use std::str::FromStr;

use kaas_core::{OrchestratorError, OrchestratorResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    /// 读取字符串列并解析为枚举
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> OrchestratorResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw: String = row.try_get(field_name)?;
        raw.parse::<T>().map_err(|e| {
            OrchestratorError::Serialization(format!("字段 {field_name} 解析失败: {e}"))
        })
    }

    /// 读取 JSON 文本列
    pub fn parse_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> OrchestratorResult<T> {
        let raw: String = row.try_get(field_name)?;
        serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::Serialization(format!("字段 {field_name} JSON解析失败: {e}"))
        })
    }

    pub fn parse_optional_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> OrchestratorResult<Option<T>> {
        let raw: Option<String> = row.try_get(field_name)?;
        raw.map(|value| {
            serde_json::from_str(&value).map_err(|e| {
                OrchestratorError::Serialization(format!("字段 {field_name} JSON解析失败: {e}"))
            })
        })
        .transpose()
    }

    pub fn to_json<T: Serialize>(value: &T) -> OrchestratorResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// SQLite INTEGER 为 i64，计数类字段在领域模型中是 u32
    pub fn get_u32(row: &SqliteRow, field_name: &str) -> OrchestratorResult<u32> {
        let value: i64 = row.try_get(field_name)?;
        u32::try_from(value).map_err(|_| {
            OrchestratorError::Serialization(format!("字段 {field_name} 超出范围: {value}"))
        })
    }
}
