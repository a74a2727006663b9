use serde::{Deserialize, Deserializer};

/// The controller serializes some integer fields as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn into_i32<E: serde::de::Error>(self) -> Result<i32, E> {
        match self {
            IntOrString::Int(value) => i32::try_from(value).map_err(E::custom),
            IntOrString::Str(value) => value.trim().parse::<i32>().map_err(E::custom),
        }
    }
}

pub fn lenient_i32<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    IntOrString::deserialize(deserializer)?.into_i32()
}

pub fn lenient_opt_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Str(value)) if value.trim().is_empty() => Ok(None),
        Some(value) => value.into_i32().map(Some),
    }
}

pub fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(0),
        Some(IntOrString::Int(value)) => Ok(value),
        Some(IntOrString::Str(value)) if value.trim().is_empty() => Ok(0),
        Some(IntOrString::Str(value)) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Booleans may arrive as `null`, `0`/`1` or `"true"`/`"false"`.
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<BoolLike>::deserialize(deserializer)? {
        None => Ok(false),
        Some(BoolLike::Bool(value)) => Ok(value),
        Some(BoolLike::Int(value)) => Ok(value != 0),
        Some(BoolLike::Str(value)) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid boolean '{other}'"))),
        },
    }
}

/// `null` reads as the type's default.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
