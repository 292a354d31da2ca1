//! Durable table definitions, reimplementing the `def_table!` pattern
//! `rostra-client-db` uses, since that crate (and its macro) is not a
//! dependency of this one.

macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

use crate::model::EventRecord;

def_table! {
    /// The latest known record for each event id.
    events: String => EventRecord
}

def_table! {
    /// The last-observed upstream `updatedAt`, stored in ISO-8601 UTC-Z form.
    last_updated: String => String
}

def_table! {
    /// The single watermark checkpoint, stored in ISO-8601 UTC-Z form.
    watermark: () => String
}
