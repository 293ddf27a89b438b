//! JSON encoding.
//!
//! Records become objects keyed by field name, unions become a single-key
//! object `{"variant": {fields}}`, binaries are lowercase hex, and refs are
//! their `blake3:<hex>` display form. Output is pretty-printed; this codec
//! exists for files people read.

use serde_json::{Map, Number, Value as Json};

use crate::capsule::Ref;
use crate::codec::{
    Codec, DecodeError, DecodeErrorKind, EncodeError, PathSegment, Schema, Value, JSON,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        JSON
    }

    fn encode(&self, schema: &Schema, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let json = to_json(schema, value)?;
        // Serializing an in-memory serde_json::Value cannot fail.
        Ok(serde_json::to_vec_pretty(&json).unwrap_or_default())
    }

    fn decode(&self, schema: &Schema, data: &[u8]) -> Result<Value, DecodeError> {
        let json: Json = serde_json::from_slice(data)
            .map_err(|e| DecodeError::new(DecodeErrorKind::InvalidJson(e.to_string())))?;
        from_json(schema, &json)
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// ── Encode ────────────────────────────────────────────────────────────────────

pub fn to_json(schema: &Schema, value: &Value) -> Result<Json, EncodeError> {
    Ok(match (schema, value) {
        (Schema::Bool, Value::Bool(b)) => Json::Bool(*b),
        (Schema::Int, Value::Int(i)) => Json::Number((*i).into()),
        (Schema::Float, Value::Float(f)) => Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| EncodeError::mismatch("finite float", "non-finite float"))?,
        (Schema::String, Value::String(s)) => Json::String(s.clone()),
        (Schema::Binary, Value::Binary(b)) => Json::String(hex::encode(b)),
        (Schema::Ref, Value::Ref(r)) => Json::String(r.to_string()),
        (Schema::Optional(_), Value::Optional(None)) => Json::Null,
        (Schema::Optional(inner), Value::Optional(Some(v))) => to_json(inner, v)?,
        (Schema::List(inner), Value::List(items)) => Json::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| to_json(inner, item).map_err(|e| e.within(PathSegment::Index(i))))
                .collect::<Result<_, _>>()?,
        ),
        (Schema::Record(fields), Value::Record(values)) => {
            if fields.len() != values.len() {
                return Err(EncodeError::mismatch("record arity", "other arity"));
            }
            let mut map = Map::new();
            for (field, v) in fields.iter().zip(values) {
                let json = to_json(&field.schema, v)
                    .map_err(|e| e.within(PathSegment::Field(field.name.clone())))?;
                map.insert(field.name.clone(), json);
            }
            Json::Object(map)
        }
        (Schema::Union(variants), Value::Variant { name, fields }) => {
            let variant = variants
                .iter()
                .find(|v| &v.name == name)
                .ok_or_else(|| EncodeError::mismatch("declared variant", "unknown variant"))?;
            let body = to_json(
                &Schema::Record(variant.fields.clone()),
                &Value::Record(fields.clone()),
            )
            .map_err(|e| e.within(PathSegment::Field(name.clone())))?;
            let mut map = Map::new();
            map.insert(name.clone(), body);
            Json::Object(map)
        }
        (schema, value) => return Err(EncodeError::mismatch(schema.kind(), value.kind())),
    })
}

// ── Decode ────────────────────────────────────────────────────────────────────

pub fn from_json(schema: &Schema, json: &Json) -> Result<Value, DecodeError> {
    let mismatch = || DecodeError::mismatch(schema.kind(), json_kind(json));
    Ok(match schema {
        Schema::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
        Schema::Int => Value::Int(json.as_i64().ok_or_else(mismatch)?),
        Schema::Float => Value::Float(json.as_f64().ok_or_else(mismatch)?),
        Schema::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
        Schema::Binary => {
            let s = json.as_str().ok_or_else(mismatch)?;
            Value::Binary(hex::decode(s).map_err(|e| DecodeError::invalid(format!("bad hex: {e}")))?)
        }
        Schema::Ref => {
            let s = json.as_str().ok_or_else(mismatch)?;
            Value::Ref(
                s.parse::<Ref>()
                    .map_err(|e| DecodeError::new(DecodeErrorKind::InvalidRef(e.to_string())))?,
            )
        }
        Schema::Optional(inner) => match json {
            Json::Null => Value::Optional(None),
            other => Value::some(from_json(inner, other)?),
        },
        Schema::List(inner) => {
            let items = json.as_array().ok_or_else(mismatch)?;
            Value::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        from_json(inner, item).map_err(|e| e.within(PathSegment::Index(i)))
                    })
                    .collect::<Result<_, _>>()?,
            )
        }
        Schema::Record(fields) => {
            let map = json.as_object().ok_or_else(mismatch)?;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let entry = match map.get(&field.name) {
                    Some(v) => v,
                    // Absent optional fields read as None.
                    None if matches!(field.schema, Schema::Optional(_)) => &Json::Null,
                    None => {
                        return Err(DecodeError::new(DecodeErrorKind::MissingField(
                            field.name.clone(),
                        )))
                    }
                };
                values.push(
                    from_json(&field.schema, entry)
                        .map_err(|e| e.within(PathSegment::Field(field.name.clone())))?,
                );
            }
            Value::Record(values)
        }
        Schema::Union(variants) => {
            let map = json.as_object().ok_or_else(mismatch)?;
            let mut entries = map.iter();
            let (name, body) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => return Err(DecodeError::invalid("union must be a single-key object")),
            };
            let variant = variants
                .iter()
                .find(|v| &v.name == name)
                .ok_or_else(|| DecodeError::new(DecodeErrorKind::UnknownVariant(name.clone())))?;
            let fields = from_json(&Schema::Record(variant.fields.clone()), body)
                .map_err(|e| e.within(PathSegment::Field(name.clone())))?;
            match fields {
                Value::Record(fields) => Value::Variant {
                    name: name.clone(),
                    fields,
                },
                other => return Err(DecodeError::mismatch("record", other.kind())),
            }
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_becomes_named_object() {
        let schema = Schema::record([
            ("name", Schema::String),
            ("blob", Schema::Binary),
            ("target", Schema::Ref),
        ]);
        let r = Ref::from_hash([0x11; 32]);
        let value = Value::Record(vec![
            Value::string("x"),
            Value::Binary(vec![0xde, 0xad]),
            Value::Ref(r),
        ]);
        let json = to_json(&schema, &value).unwrap();
        assert_eq!(json["name"], "x");
        assert_eq!(json["blob"], "dead");
        assert_eq!(json["target"], r.to_string());
        assert_eq!(from_json(&schema, &json).unwrap(), value);
    }

    #[test]
    fn union_is_single_key_object() {
        let schema = Schema::union([("ok", vec![("value", Schema::Int)])]);
        let value = Value::variant("ok", vec![Value::Int(3)]);
        let json = to_json(&schema, &value).unwrap();
        assert_eq!(json, serde_json::json!({"ok": {"value": 3}}));
        assert_eq!(from_json(&schema, &json).unwrap(), value);
    }

    #[test]
    fn missing_optional_field_reads_as_none() {
        let schema = Schema::record([("a", Schema::Int), ("b", Schema::optional(Schema::Int))]);
        let value = from_json(&schema, &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(value, Value::Record(vec![Value::Int(1), Value::Optional(None)]));
    }

    #[test]
    fn missing_required_field_names_it() {
        let schema = Schema::record([("a", Schema::Int)]);
        let err = from_json(&schema, &serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MissingField("a".into()));
    }

    #[test]
    fn nested_error_path() {
        let schema = Schema::record([("roots", Schema::list(Schema::Ref))]);
        let json = serde_json::json!({"roots": ["blake3:zz"]});
        let err = from_json(&schema, &json).unwrap_err();
        assert_eq!(err.path.to_string(), "roots.0");
    }

    #[test]
    fn codec_rejects_garbage() {
        let err = JsonCodec.decode(&Schema::Int, b"{not json").unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::InvalidJson(_)));
    }
}
