//! Generated protobuf message types for the persisted file descriptor, plus
//! the small amount of derived (non-persisted) shape built on top of them.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/nzbfs.meta.rs"));

impl FileDescriptor {
    pub fn is_corrupted(&self) -> bool {
        self.status == FileStatus::Corrupted as i32
    }

    pub fn mark_corrupted(&mut self) {
        self.status = FileStatus::Corrupted as i32;
    }

    pub fn encryption_kind(&self) -> Encryption {
        Encryption::try_from(self.encryption).unwrap_or(Encryption::None)
    }
}
