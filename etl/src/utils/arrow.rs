use arrow::array::{
    Array,
    BooleanArray,
    Float64Array,
    Int32Array,
    Int64Array,
    StringArray,
    StringViewArray,
    TimestampMillisecondArray,
    TimestampMicrosecondArray,
    TimestampNanosecondArray,
    TimestampSecondArray,
    UInt64Array,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use serde_json::{Number, Value};

/// Renders record batches as one JSON object per row.
pub fn batches_to_json(batches: &[RecordBatch]) -> Result<Vec<Value>> {
    let mut json_rows = Vec::new();

    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = serde_json::Map::new();

            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = arrow_array_to_json(batch.column(col_idx).as_ref(), row_idx)?;
                row.insert(field.name().clone(), value);
            }

            json_rows.push(Value::Object(row));
        }
    }

    Ok(json_rows)
}

fn downcast<T: 'static>(array: &dyn Array) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::Other(format!(
            "Unexpected array implementation for {:?}",
            array.data_type()
        ))
    })
}

fn timestamp_to_json(datetime: Option<DateTime<Utc>>) -> Value {
    datetime
        .map(|dt| Value::String(dt.to_rfc3339()))
        .unwrap_or(Value::Null)
}

pub fn arrow_array_to_json(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }

    Ok(match array.data_type() {
        DataType::Boolean => Value::Bool(downcast::<BooleanArray>(array)?.value(index)),
        DataType::Int32 => Value::Number(Number::from(downcast::<Int32Array>(array)?.value(index))),
        DataType::Int64 => Value::Number(Number::from(downcast::<Int64Array>(array)?.value(index))),
        DataType::UInt64 => {
            Value::Number(Number::from(downcast::<UInt64Array>(array)?.value(index)))
        }
        DataType::Float64 => Number::from_f64(downcast::<Float64Array>(array)?.value(index))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Utf8 => Value::String(downcast::<StringArray>(array)?.value(index).to_string()),
        DataType::Utf8View => {
            Value::String(downcast::<StringViewArray>(array)?.value(index).to_string())
        }
        DataType::Timestamp(unit, _) => match unit {
            TimeUnit::Millisecond => {
                let ts = downcast::<TimestampMillisecondArray>(array)?.value(index);
                timestamp_to_json(DateTime::from_timestamp_millis(ts))
            }
            TimeUnit::Microsecond => {
                let ts = downcast::<TimestampMicrosecondArray>(array)?.value(index);
                timestamp_to_json(DateTime::from_timestamp_micros(ts))
            }
            TimeUnit::Nanosecond => {
                let ts = downcast::<TimestampNanosecondArray>(array)?.value(index);
                timestamp_to_json(Some(DateTime::from_timestamp_nanos(ts)))
            }
            TimeUnit::Second => {
                let ts = downcast::<TimestampSecondArray>(array)?.value(index);
                timestamp_to_json(DateTime::from_timestamp(ts, 0))
            }
        },
        other => {
            return Err(Error::Other(format!(
                "Cannot render {} values as JSON",
                other
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float32Array;
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_batches_to_json_handles_nulls_and_timestamps() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
            Field::new(
                "start_time",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
                Arc::new(Float64Array::from(vec![Some(1.5), None])),
                Arc::new(TimestampMillisecondArray::from(vec![0, 1_000])),
            ],
        )
        .unwrap();

        let rows = batches_to_json(&[batch]).unwrap();
        assert_eq!(
            rows[0],
            json!({"id": 1, "name": "a", "score": 1.5, "start_time": "1970-01-01T00:00:00+00:00"})
        );
        assert_eq!(rows[1]["name"], Value::Null);
        assert_eq!(rows[1]["score"], Value::Null);
        assert_eq!(rows[1]["start_time"], "1970-01-01T00:00:01+00:00");
    }

    #[test]
    fn test_unsupported_type_is_an_error() {
        let schema = Arc::new(Schema::new(vec![Field::new("ratio", DataType::Float32, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float32Array::from(vec![Some(0.5)]))],
        )
        .unwrap();

        let err = batches_to_json(&[batch]).unwrap_err();
        assert!(matches!(err, Error::Other(ref msg) if msg.contains("Float32")));
    }

    #[test]
    fn test_null_of_unsupported_type_is_still_null() {
        let array = Float32Array::from(vec![None::<f32>]);
        assert_eq!(arrow_array_to_json(&array, 0).unwrap(), Value::Null);
    }
}
