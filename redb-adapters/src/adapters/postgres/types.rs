//! Conversions between Postgres wire values and JSON rows.

use std::error::Error;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use redb_types::log::warn;
use redb_types::models::JsonRow;
use redb_types::serde_json::{self, Number, Value};
use rust_decimal::Decimal;
use tokio_postgres::Row;

type BoxedDynError = Box<dyn Error + Sync + Send>;

/// A JSON value encoded against whatever column type the statement expects.
#[derive(Debug)]
pub(super) struct JsonParam<'a>(pub &'a Value);

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxedDynError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Number(n) => number_to_sql(n, ty, out),
            Value::String(s) => string_to_sql(s, ty, out),
            Value::Array(_) | Value::Object(_) => {
                if *ty == Type::JSON || *ty == Type::JSONB {
                    self.0.to_sql(ty, out)
                } else {
                    Err(format!("cannot encode a JSON container into {ty}").into())
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn number_to_sql(n: &Number, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxedDynError> {
    let out_of_range = || -> BoxedDynError { format!("number {n} does not fit {ty}").into() };
    if *ty == Type::INT2 {
        i16::try_from(number_i64(n)?).map_err(|_| out_of_range())?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(number_i64(n)?).map_err(|_| out_of_range())?.to_sql(ty, out)
    } else if *ty == Type::INT8 {
        number_i64(n)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (number_f64(n)? as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        number_f64(n)?.to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from_str(&n.to_string())?.to_sql(ty, out)
    } else if *ty == Type::OID {
        u32::try_from(number_i64(n)?).map_err(|_| out_of_range())?.to_sql(ty, out)
    } else {
        Err(format!("cannot encode a number into {ty}").into())
    }
}

fn string_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxedDynError> {
    if *ty == Type::TIMESTAMPTZ {
        DateTime::parse_from_rfc3339(s)?
            .with_timezone(&Utc)
            .to_sql(ty, out)
    } else if *ty == Type::TIMESTAMP {
        parse_naive_datetime(s)?.to_sql(ty, out)
    } else if *ty == Type::DATE {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")?.to_sql(ty, out)
    } else if *ty == Type::TIME {
        NaiveTime::parse_from_str(s, "%H:%M:%S%.f")?.to_sql(ty, out)
    } else if *ty == Type::UUID {
        uuid::Uuid::parse_str(s)?.to_sql(ty, out)
    } else if *ty == Type::BYTEA {
        BASE64.decode(s)?.to_sql(ty, out)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Value::String(s.to_string()).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from_str(s)?.to_sql(ty, out)
    } else {
        s.to_sql(ty, out)
    }
}

fn parse_naive_datetime(s: &str) -> Result<NaiveDateTime, BoxedDynError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| -> BoxedDynError { Box::new(e) })
}

fn number_i64(n: &Number) -> Result<i64, BoxedDynError> {
    n.as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .ok_or_else(|| format!("number {n} is out of integer range").into())
}

fn number_f64(n: &Number) -> Result<f64, BoxedDynError> {
    n.as_f64()
        .ok_or_else(|| format!("number {n} is not representable as f64").into())
}

pub(super) fn rows_to_json(rows: &[Row]) -> Result<Vec<JsonRow>, BoxedDynError> {
    rows.iter().map(row_to_json).collect()
}

pub(super) fn row_to_json(row: &Row) -> Result<JsonRow, BoxedDynError> {
    let mut out = JsonRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = column_value(row, i, column.type_())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_value(row: &Row, i: usize, ty: &Type) -> Result<Value, BoxedDynError> {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i)?.map(|v| Value::Number(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i)?.map(|v| Value::Number(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i)?.map(|v| Value::Number(v.into()))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(i)?
            .and_then(|v| Number::from_f64(f64::from(v)))
            .map(Value::Number)
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(i)?
            .and_then(Number::from_f64)
            .map(Value::Number)
    } else if *ty == Type::NUMERIC {
        row.try_get::<_, Option<Decimal>>(i)?.map(decimal_to_value)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(i)?
            .map(|t| Value::String(t.to_rfc3339()))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(i)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(i)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
    } else if *ty == Type::TIME {
        row.try_get::<_, Option<NaiveTime>>(i)?
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(i)?
            .map(|u| Value::String(u.to_string()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(i)?
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(i)?
            .map(|b| Value::String(BASE64.encode(b)))
    } else {
        match row.try_get::<_, Option<String>>(i) {
            Ok(v) => v.map(Value::String),
            Err(_) => {
                warn!(
                    "column `{}` has unmapped type {ty}, emitting null",
                    row.columns()[i].name()
                );
                Some(Value::Null)
            }
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decimal_to_value(d: Decimal) -> Value {
    let rendered = d.to_string();
    serde_json::from_str::<Number>(&rendered)
        .map(Value::Number)
        .unwrap_or(Value::String(rendered))
}
