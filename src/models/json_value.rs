//! 类型擦除的 JSON 值
//!
//! 用于承载请求中结构未知的字段（tool input、input_schema 等），
//! 保证编码 → 解码后结构完全一致，对象键保持原始顺序。

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// 任意 JSON 值
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AnyValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<AnyValue>),
    Object(IndexMap<String, AnyValue>),
}

impl AnyValue {
    /// 空对象
    pub fn empty_object() -> Self {
        AnyValue::Object(IndexMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AnyValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// 按键取对象字段
    pub fn get(&self, key: &str) -> Option<&AnyValue> {
        match self {
            AnyValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// 序列化为紧凑 JSON 字符串
    pub fn to_json_string(&self) -> String {
        // 自定义 Serialize 不会失败；非有限浮点数按 serde_json 规则写为 null
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

impl Serialize for AnyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            AnyValue::Null => serializer.serialize_unit(),
            AnyValue::Bool(b) => serializer.serialize_bool(*b),
            AnyValue::Int(i) => serializer.serialize_i64(*i),
            AnyValue::Double(d) => serializer.serialize_f64(*d),
            AnyValue::String(s) => serializer.serialize_str(s),
            AnyValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            AnyValue::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

struct AnyValueVisitor;

impl<'de> Visitor<'de> for AnyValueVisitor {
    type Value = AnyValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<AnyValue, E> {
        Ok(AnyValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<AnyValue, E> {
        Ok(AnyValue::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<AnyValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        AnyValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<AnyValue, E> {
        Ok(AnyValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<AnyValue, E> {
        Ok(AnyValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<AnyValue, E> {
        // 超出 i64 范围的整数退化为浮点数
        Ok(i64::try_from(v)
            .map(AnyValue::Int)
            .unwrap_or(AnyValue::Double(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<AnyValue, E> {
        Ok(AnyValue::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<AnyValue, E> {
        Ok(AnyValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<AnyValue, E> {
        Ok(AnyValue::String(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<AnyValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<AnyValue>()? {
            items.push(item);
        }
        Ok(AnyValue::Array(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<AnyValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut object = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, AnyValue>()? {
            object.insert(key, value);
        }
        Ok(AnyValue::Object(object))
    }
}

impl<'de> Deserialize<'de> for AnyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(AnyValueVisitor)
    }
}

impl From<&str> for AnyValue {
    fn from(s: &str) -> Self {
        AnyValue::String(s.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(s: String) -> Self {
        AnyValue::String(s)
    }
}

impl From<bool> for AnyValue {
    fn from(b: bool) -> Self {
        AnyValue::Bool(b)
    }
}

impl From<i64> for AnyValue {
    fn from(i: i64) -> Self {
        AnyValue::Int(i)
    }
}

impl From<f64> for AnyValue {
    fn from(d: f64) -> Self {
        AnyValue::Double(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_nested_value() {
        let value: AnyValue =
            serde_json::from_str(r#"{"b":1,"a":[true,null,2.5,"x"],"c":{"d":-3}}"#).unwrap();

        let AnyValue::Object(map) = &value else {
            panic!("expected object");
        };
        // 键顺序与输入一致
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(map["b"], AnyValue::Int(1));
        assert_eq!(
            map["a"],
            AnyValue::Array(vec![
                AnyValue::Bool(true),
                AnyValue::Null,
                AnyValue::Double(2.5),
                AnyValue::String("x".to_string()),
            ])
        );
        assert_eq!(value.get("c").and_then(|c| c.get("d")), Some(&AnyValue::Int(-3)));
    }

    #[test]
    fn test_encode_preserves_key_order() {
        let raw = r#"{"z":1,"a":{"y":[1,2],"b":"s"}}"#;
        let value: AnyValue = serde_json::from_str(raw).unwrap();
        assert_eq!(value.to_json_string(), raw);
    }

    #[test]
    fn test_large_unsigned_becomes_double() {
        let value: AnyValue = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(value, AnyValue::Double(_)));
    }

    fn arb_any_value() -> impl Strategy<Value = AnyValue> {
        let leaf = prop_oneof![
            Just(AnyValue::Null),
            any::<bool>().prop_map(AnyValue::Bool),
            any::<i64>().prop_map(AnyValue::Int),
            // 使用可精确往返的二进制小数
            (-1_000_000i32..1_000_000).prop_map(|n| AnyValue::Double(n as f64 + 0.5)),
            "[a-zA-Z0-9 _\\-\"\\\\]{0,12}".prop_map(AnyValue::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(AnyValue::Array),
                prop::collection::vec(("[a-z]{1,6}", inner), 0..6).prop_map(|entries| {
                    AnyValue::Object(entries.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        /// 编码后再解码得到结构相同的值
        #[test]
        fn prop_any_value_round_trip(value in arb_any_value()) {
            let encoded = serde_json::to_string(&value).unwrap();
            let decoded: AnyValue = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
