//! Storage engine: schema, connection initialization, chunked blob I/O.

mod chunks;
mod conn;
mod handle;

pub(crate) use chunks::CacheConn;
pub(crate) use conn::{init_conn, init_database, open_conn};
pub use conn::init_schema;
pub(crate) use handle::BlobHandle;

/// Schema for keys, chunk storage, tags, and settings. Idempotent.
///
/// A logical value is one `keys` row; its bytes live in `blobs` chunks mapped
/// by `"values" (value_id, offset)`. Both foreign keys cascade so deleting a
/// key (directly or via capacity trim) tears down its mapping rows, and
/// deleting a chunk tears down the rows that reference it.
pub(crate) const SCHEMA: &str = r#"
create table if not exists keys (
    key_id integer primary key autoincrement,
    key text unique not null,
    length integer not null default 0,
    last_used integer not null default (cast(unixepoch('subsec')*1e3 as integer)),
    access_count integer not null default 0
);

create index if not exists keys_by_last_used on keys (last_used, key_id);

create table if not exists blobs (
    blob_id integer primary key autoincrement,
    blob blob not null
);

create table if not exists "values" (
    value_id integer not null references keys (key_id) on delete cascade,
    offset integer not null,
    blob_id integer not null references blobs (blob_id) on delete cascade,
    primary key (value_id, offset)
);

create index if not exists values_by_blob_id on "values" (blob_id);

create table if not exists tags (
    key_id integer not null references keys (key_id) on delete cascade,
    name text not null,
    value,
    primary key (key_id, name) on conflict replace
);

create table if not exists setting (
    name text primary key on conflict replace,
    value
);
"#;

/// Accounting and capacity-trim triggers. Idempotent; requires
/// `recursive_triggers` and `foreign_keys` on the firing connection.
///
/// `blob_meta('size')` carries the running total of stored chunk bytes so
/// capacity checks never scan `blobs`. `evictable_key` walks keys in
/// `(last_used, key_id)` order accumulating the usage that would remain after
/// deleting each one, and stops as soon as usage fits under
/// `setting('capacity')`; no capacity row means nothing is ever evictable.
/// Trimming deletes `keys` rows, which cascades to `"values"`, whose delete
/// trigger drops the chunk, whose delete trigger keeps the total current.
pub(crate) const TRIGGERS: &str = r#"
create table if not exists blob_meta (
    name text primary key on conflict replace,
    value
);

insert or ignore into blob_meta (name, value)
values ('size', (select coalesce(sum(length(blob)), 0) from blobs));

create view if not exists evictable_key as
with recursive excess (usage_with, last_used, key_id, key_length) as (
    select *
    from (
        select
            (select value from blob_meta where name = 'size') as usage_with,
            last_used,
            key_id,
            length
        from keys
        order by last_used, key_id
        limit 1
    )
    where usage_with > (select value from setting where name = 'capacity')
    union all
    select
        excess.usage_with - excess.key_length,
        keys.last_used,
        keys.key_id,
        keys.length
    from excess
    join keys on keys.key_id = (
        select key_id
        from keys
        where (last_used, key_id) > (excess.last_used, excess.key_id)
        order by last_used, key_id
        limit 1
    )
    where excess.usage_with - excess.key_length
        > (select value from setting where name = 'capacity')
)
select key_id from excess;

create trigger if not exists blobs_grew
after insert on blobs
begin
    update blob_meta set value = value + length(new.blob) where name = 'size';
    delete from keys where key_id in (select key_id from evictable_key);
end;

create trigger if not exists blobs_resized
after update of blob on blobs
begin
    update blob_meta
        set value = value + length(new.blob) - length(old.blob)
        where name = 'size';
    update keys
        set length = length + length(new.blob) - length(old.blob),
            last_used = cast(unixepoch('subsec')*1e3 as integer)
        where key_id = (select value_id from "values" where blob_id = new.blob_id);
    delete from keys where key_id in (select key_id from evictable_key);
end;

create trigger if not exists blobs_freed
after delete on blobs
begin
    update blob_meta set value = value - length(old.blob) where name = 'size';
end;

create trigger if not exists values_dropped
after delete on "values"
begin
    delete from blobs where blob_id = old.blob_id;
end;
"#;
