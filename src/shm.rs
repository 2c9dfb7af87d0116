//! Shared schedule block: the fixed-size, multi-process-visible byte region
//! holding a step's mutable scheduling and progress fields.
//!
//! Layout (18 bytes):
//!
//! | field           | offset | width | repr               |
//! |-----------------|--------|-------|--------------------|
//! | scheduled_time  | 0      | 8     | f64 bits, AtomicU64 |
//! | weight          | 8      | 8     | f64 bits, AtomicU64 |
//! | stage           | 16     | 1     | AtomicU8 stage tag |
//! | began_allreduce | 17     | 1     | AtomicU8 bool      |
//!
//! Each field is independently lock-free; no cross-field atomicity is
//! provided and callers must not assume ordering between fields. The block
//! serializes as its OS id, so a handle passed to another process reattaches
//! over the same allocation.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf};
use uuid::Uuid;

use crate::error::{ControlError, Result};
use crate::stage::AveragingStage;

/// Total size of the block in bytes.
pub const BLOCK_LEN: usize = 18;

/// Default prefix for segment names.
pub const DEFAULT_SHM_PREFIX: &str = "avg_step";

const SCHEDULED_TIME_OFFSET: usize = 0;
const WEIGHT_OFFSET: usize = 8;
const STAGE_OFFSET: usize = 16;
const BEGAN_ALLREDUCE_OFFSET: usize = 17;

/// A named shared-memory segment with per-field atomic accessors.
pub struct SharedScheduleBlock {
    shmem: Shmem,
}

// SAFETY: all access to the mapping goes through atomic operations at fixed
// offsets; the segment itself is valid for the lifetime of `shmem`.
unsafe impl Send for SharedScheduleBlock {}
unsafe impl Sync for SharedScheduleBlock {}

impl SharedScheduleBlock {
    /// Allocates a new zero-initialized block under the default name prefix.
    pub fn create() -> Result<Self> {
        Self::create_with_prefix(DEFAULT_SHM_PREFIX)
    }

    /// Allocates a new zero-initialized block.
    ///
    /// The segment gets a unique OS id derived from `prefix`; retrieve it
    /// with [`os_id`](Self::os_id) to let another process attach.
    pub fn create_with_prefix(prefix: &str) -> Result<Self> {
        let os_id = format!("{}_{}", prefix, Uuid::new_v4().as_simple());
        let shmem = ShmemConf::new()
            .os_id(&os_id)
            .size(BLOCK_LEN)
            .create()
            .map_err(|e| {
                ControlError::shared_memory_with_source("failed to create schedule block", e)
            })?;

        let block = Self { shmem };
        block.set_scheduled_time(0.0);
        block.u64_at(WEIGHT_OFFSET).store(0, Ordering::Release);
        block.set_stage(AveragingStage::Idle);
        block.set_began_allreduce(false);
        Ok(block)
    }

    /// Attaches to an existing block by OS id.
    ///
    /// # Errors
    ///
    /// Fails if the segment does not exist or is smaller than [`BLOCK_LEN`].
    pub fn attach(os_id: &str) -> Result<Self> {
        let shmem = ShmemConf::new().os_id(os_id).open().map_err(|e| {
            ControlError::shared_memory_with_source(
                format!("failed to attach schedule block '{os_id}'"),
                e,
            )
        })?;

        if shmem.len() < BLOCK_LEN {
            return Err(ControlError::shared_memory(format!(
                "schedule block '{}' is {} bytes, expected at least {}",
                os_id,
                shmem.len(),
                BLOCK_LEN
            )));
        }

        Ok(Self { shmem })
    }

    /// OS identifier of the underlying segment.
    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    fn u64_at(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= BLOCK_LEN);
        // SAFETY: the segment base is page-aligned and at least BLOCK_LEN
        // bytes long, and `offset` is 8-byte aligned and in bounds.
        unsafe { &*(self.shmem.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn u8_at(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset < BLOCK_LEN);
        // SAFETY: `offset` is in bounds of the mapping.
        unsafe { &*(self.shmem.as_ptr().add(offset) as *const AtomicU8) }
    }

    pub fn scheduled_time(&self) -> f64 {
        f64::from_bits(self.u64_at(SCHEDULED_TIME_OFFSET).load(Ordering::Acquire))
    }

    pub fn set_scheduled_time(&self, scheduled_time: f64) {
        self.u64_at(SCHEDULED_TIME_OFFSET)
            .store(scheduled_time.to_bits(), Ordering::Release);
    }

    pub fn weight(&self) -> f64 {
        f64::from_bits(self.u64_at(WEIGHT_OFFSET).load(Ordering::Acquire))
    }

    /// Stores a new averaging weight.
    ///
    /// # Errors
    ///
    /// A negative or non-finite weight is rejected before it reaches shared
    /// storage; the stored value is unchanged.
    pub fn set_weight(&self, weight: f64) -> Result<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(ControlError::precondition(format!(
                "weight must be finite and non-negative, got {weight}"
            )));
        }
        self.u64_at(WEIGHT_OFFSET)
            .store(weight.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Decodes the current stage.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the stored tag is out of range.
    pub fn stage(&self) -> Result<AveragingStage> {
        AveragingStage::from_tag(self.u8_at(STAGE_OFFSET).load(Ordering::Acquire))
    }

    pub fn set_stage(&self, stage: AveragingStage) {
        self.u8_at(STAGE_OFFSET).store(stage.as_tag(), Ordering::Release);
    }

    pub fn began_allreduce(&self) -> bool {
        self.u8_at(BEGAN_ALLREDUCE_OFFSET).load(Ordering::Acquire) != 0
    }

    pub fn set_began_allreduce(&self, value: bool) {
        self.u8_at(BEGAN_ALLREDUCE_OFFSET)
            .store(u8::from(value), Ordering::Release);
    }
}

impl fmt::Debug for SharedScheduleBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScheduleBlock")
            .field("os_id", &self.os_id())
            .field("scheduled_time", &self.scheduled_time())
            .field("weight", &self.weight())
            .field("stage_tag", &self.u8_at(STAGE_OFFSET).load(Ordering::Acquire))
            .field("began_allreduce", &self.began_allreduce())
            .finish()
    }
}

impl Serialize for SharedScheduleBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.os_id())
    }
}

impl<'de> Deserialize<'de> for SharedScheduleBlock {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct OsIdVisitor;

        impl Visitor<'_> for OsIdVisitor {
            type Value = SharedScheduleBlock;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a shared memory OS id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                SharedScheduleBlock::attach(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(OsIdVisitor)
    }
}
