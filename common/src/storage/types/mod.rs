use serde::{Deserialize, Serialize};

pub mod api_key;
pub mod chat;
pub mod chat_message;
pub mod chunk;
pub mod document;
pub mod embedding;
pub mod ingestion_job;
pub mod kb_membership;
pub mod knowledge_base;
pub mod system_settings;
pub mod usage_counters;
pub mod user;
pub mod webhook;
pub mod webhook_delivery;

pub trait StoredObject: Serialize + for<'de> Deserialize<'de> {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// Generates a struct implementing [`StoredObject`] with the id/timestamp shape every
/// persisted entity shares: flexible id decoding (accepts either a bare string or a
/// SurrealDB `Thing`), and `created_at`/`updated_at` round-tripped through
/// `surrealdb::sql::Datetime`.
#[macro_export]
macro_rules! stored_object {
    ($name:ident, $table:expr, {$($(#[$attr:meta])* $field:ident: $ty:ty),* $(,)?}) => {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
        pub struct $name {
            #[serde(deserialize_with = "$crate::storage::types::deserialize_flexible_id")]
            pub id: String,
            #[serde(
                serialize_with = "$crate::storage::types::serialize_datetime",
                deserialize_with = "$crate::storage::types::deserialize_datetime",
                default
            )]
            pub created_at: chrono::DateTime<chrono::Utc>,
            #[serde(
                serialize_with = "$crate::storage::types::serialize_datetime",
                deserialize_with = "$crate::storage::types::deserialize_datetime",
                default
            )]
            pub updated_at: chrono::DateTime<chrono::Utc>,
            $( $(#[$attr])* pub $field: $ty),*
        }

        impl $crate::storage::types::StoredObject for $name {
            fn table_name() -> &'static str {
                $table
            }

            fn get_id(&self) -> &str {
                &self.id
            }
        }
    };
}

struct FlexibleIdVisitor;

impl<'de> serde::de::Visitor<'de> for FlexibleIdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string or a Thing")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(value.to_string())
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(value)
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let thing = surrealdb::sql::Thing::deserialize(serde::de::value::MapAccessDeserializer::new(map))?;
        Ok(thing.id.to_raw())
    }
}

pub fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleIdVisitor)
}

pub fn serialize_datetime<S>(
    date: &chrono::DateTime<chrono::Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    Into::<surrealdb::sql::Datetime>::into(*date).serialize(serializer)
}

pub fn deserialize_datetime<'de, D>(deserializer: D) -> Result<chrono::DateTime<chrono::Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let dt = surrealdb::sql::Datetime::deserialize(deserializer)?;
    Ok(chrono::DateTime::<chrono::Utc>::from(dt))
}
