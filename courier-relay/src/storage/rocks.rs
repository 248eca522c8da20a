//! RocksDB-backed message ledger.
//!
//! Column families:
//! - `conversations` — bincode Conversation records, keyed by conversation id
//! - `messages`      — LZ4-compressed bincode Message records, keyed by message id
//! - `timeline`      — ordering index, key `conv_id:16 ‖ sent_at:8 BE ‖ msg_id:16`
//!
//! Every mutation that touches more than one key goes through a single
//! `WriteBatch`, so a message and its timeline entry appear and disappear
//! together.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::{decode_record, encode_record, LockStripes, MessageLedger, StoreError};
use crate::model::{now_millis, Conversation, Message, NewConversation};

const CF_CONVERSATIONS: &str = "conversations";
const CF_MESSAGES: &str = "messages";
const CF_TIMELINE: &str = "timeline";

const COLUMN_FAMILIES: &[&str] = &[CF_CONVERSATIONS, CF_MESSAGES, CF_TIMELINE];

/// Timeline key length: conversation id + sent_at + message id.
const TIMELINE_KEY_LEN: usize = 16 + 8 + 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: true, a submitter is only answered after the write is durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Number of per-message lock stripes (default: 64)
    pub lock_stripes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("courier_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            lock_stripes: 64,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            lock_stripes: 8,
        }
    }
}

/// Durable ledger on RocksDB.
pub struct RocksLedger {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Per-message mutation locks
    locks: LockStripes,
    /// Held shared by message mutations, exclusively by conversation removal
    conversation_guard: RwLock<()>,
}

impl RocksLedger {
    /// Open the ledger at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened message ledger at {}", config.path.display());

        Ok(Self {
            db,
            locks: LockStripes::new(config.lock_stripes),
            conversation_guard: RwLock::new(()),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CONVERSATIONS => {
                opts.set_max_write_buffer_number(2);
                // Takes megabytes
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)).max(1) as u64);
            }
            CF_MESSAGES => {
                // Values are already LZ4-compressed records
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_TIMELINE => {
                // Prefix-scanned by conversation id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn timeline_key(message: &Message) -> Vec<u8> {
        let mut key = Vec::with_capacity(TIMELINE_KEY_LEN);
        key.extend_from_slice(message.conversation_id.as_bytes());
        key.extend_from_slice(&message.sent_at.to_be_bytes());
        key.extend_from_slice(message.id.as_bytes());
        key
    }

    fn encode_message(message: &Message) -> Result<Vec<u8>, StoreError> {
        Ok(lz4_flex::compress_prepend_size(&encode_record(message)?))
    }

    fn decode_message(bytes: &[u8]) -> Result<Message, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        decode_record(&raw)
    }

    fn load_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_message(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Timeline keys for one conversation, in key (= sent_at) order.
    fn timeline_keys(&self, conversation_id: Uuid) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_TIMELINE)?;
        let prefix = conversation_id.as_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() != TIMELINE_KEY_LEN || &key[..16] != prefix {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn message_id_from_timeline_key(key: &[u8]) -> Result<Uuid, StoreError> {
        let bytes: [u8; 16] = key[24..TIMELINE_KEY_LEN]
            .try_into()
            .map_err(|_| StoreError::DeserializationError("Invalid timeline key".into()))?;
        Ok(Uuid::from_bytes(bytes))
    }
}

impl MessageLedger for RocksLedger {
    fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            members: new.members,
            created_at: now_millis(),
        };
        let cf = self.cf(CF_CONVERSATIONS)?;
        self.db.put_cf_opt(
            cf,
            conversation.id.as_bytes(),
            encode_record(&conversation)?,
            &self.write_options(),
        )?;
        Ok(conversation)
    }

    fn get_conversation(&self, id: Uuid) -> Result<Conversation, StoreError> {
        let cf = self.cf(CF_CONVERSATIONS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::ConversationNotFound(id)),
        }
    }

    fn conversation_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_CONVERSATIONS)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?.is_some())
    }

    fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let cf = self.cf(CF_CONVERSATIONS)?;
        let mut found = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let conversation: Conversation = decode_record(&value)?;
            if conversation.has_member(user_id) {
                found.push(conversation);
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn delete_conversation(&self, id: Uuid) -> Result<usize, StoreError> {
        let _exclusive = self
            .conversation_guard
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.conversation_exists(id)? {
            return Err(StoreError::ConversationNotFound(id));
        }

        let cf_conv = self.cf(CF_CONVERSATIONS)?;
        let cf_msgs = self.cf(CF_MESSAGES)?;
        let cf_timeline = self.cf(CF_TIMELINE)?;

        let keys = self.timeline_keys(id)?;
        let mut batch = WriteBatch::default();
        for key in &keys {
            let message_id = Self::message_id_from_timeline_key(key)?;
            batch.delete_cf(cf_msgs, message_id.as_bytes());
            batch.delete_cf(cf_timeline, key);
        }
        batch.delete_cf(cf_conv, id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Deleted conversation {id} with {} messages", keys.len());
        Ok(keys.len())
    }

    fn append_message(&self, message: &Message) -> Result<Message, StoreError> {
        let _shared = self
            .conversation_guard
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let _lock = self.locks.lock(&message.id);

        if !self.conversation_exists(message.conversation_id)? {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        }
        if let Some(existing) = self.load_message(message.id)? {
            log::debug!("Message {} already committed, skipping append", message.id);
            return Ok(existing);
        }

        let cf_msgs = self.cf(CF_MESSAGES)?;
        let cf_timeline = self.cf(CF_TIMELINE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_msgs, message.id.as_bytes(), Self::encode_message(message)?);
        batch.put_cf(cf_timeline, Self::timeline_key(message), b"");
        self.db.write_opt(batch, &self.write_options())?;

        Ok(message.clone())
    }

    fn update_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError> {
        let _shared = self
            .conversation_guard
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let _lock = self.locks.lock(&message_id);

        let mut message = match self.load_message(message_id)? {
            Some(m) if m.conversation_id == conversation_id => m,
            _ => return Err(StoreError::MessageNotFound(message_id)),
        };
        message.body = body.to_string();

        let cf = self.cf(CF_MESSAGES)?;
        self.db.put_cf_opt(
            cf,
            message_id.as_bytes(),
            Self::encode_message(&message)?,
            &self.write_options(),
        )?;
        Ok(message)
    }

    fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, StoreError> {
        let _shared = self
            .conversation_guard
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let _lock = self.locks.lock(&message_id);

        let message = match self.load_message(message_id)? {
            Some(m) if m.conversation_id == conversation_id => m,
            _ => return Err(StoreError::MessageNotFound(message_id)),
        };

        let cf_msgs = self.cf(CF_MESSAGES)?;
        let cf_timeline = self.cf(CF_TIMELINE)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_msgs, message_id.as_bytes());
        batch.delete_cf(cf_timeline, Self::timeline_key(&message));
        self.db.write_opt(batch, &self.write_options())?;

        Ok(message)
    }

    fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        if !self.conversation_exists(conversation_id)? {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        let keys = self.timeline_keys(conversation_id)?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in &keys {
            let id = Self::message_id_from_timeline_key(key)?;
            // A concurrent delete may remove the record between the scan and the read
            if let Some(message) = self.load_message(id)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
