// SPDX-License-Identifier: MPL-2.0

//! Latest-frame storage shared between producer threads and the render thread.
//!
//! Each stream role owns exactly one buffer. Producers overwrite it and raise
//! the role's update flag; the render thread takes the flags and copies the
//! buffers out before rendering:
//!
//! ```text
//! ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//! │ local cam   │  │ remote peer │  │ extended    │
//! └─────┬───────┘  └─────┬───────┘  └─────┬───────┘
//!       │ store() - overwrites, never queues │
//!       ▼                ▼                   ▼
//! ┌──────────────────────────────────────────────┐
//! │ FrameStore  [local] [remote] [extended]      │ ← guarded by the shared lock
//! │             UpdateRequired flags             │
//! └─────────────────────┬────────────────────────┘
//!                       │ take_updates() + copy out
//!                       ▼
//!                ┌─────────────┐
//!                │ Render loop │
//!                └─────────────┘
//! ```
//!
//! # Key Guarantees
//!
//! - **Lossy**: a frame stored before the previous one was rendered replaces it
//! - **Exact sizing**: a buffer always holds `width * height * 3 / 2` bytes
//!   after a write, reallocating only when the frame size changes

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical video stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// the user's own camera preview
    Local,
    /// the conference peer
    Remote,
    /// an auxiliary stream, such as screen sharing
    Extended,
}

impl StreamRole {
    pub const ALL: [StreamRole; 3] = [Self::Local, Self::Remote, Self::Extended];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
            Self::Extended => 2,
        }
    }
}

/// Smallest width and height that still carries a chroma sample per plane.
pub const MIN_FRAME_EXTENT: u32 = 2;

/// Byte length of a planar YUV 4:2:0 frame of the given size.
#[must_use]
pub fn i420_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

/// One raw planar YUV 4:2:0 frame.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameBuffer({}x{}, {} bytes)", self.width, self.height, self.data.len())
    }
}

impl FrameBuffer {
    /// Copy a frame in, resizing the buffer to the exact frame length first.
    ///
    /// Only the first `width * height * 3 / 2` bytes of `data` are used; a
    /// shorter slice leaves the tail of the buffer zeroed.
    pub fn write(&mut self, data: &[u8], width: u32, height: u32) {
        let len = i420_len(width, height);
        if self.data.len() != len {
            self.data.resize(len, 0);
        }

        let copied = len.min(data.len());
        self.data[..copied].copy_from_slice(&data[..copied]);
        self.data[copied..].fill(0);
        self.width = width;
        self.height = height;
    }

    /// Replace this buffer's contents with another's, reusing the allocation.
    pub fn copy_from(&mut self, other: &FrameBuffer) {
        self.data.clone_from(&other.data);
        self.width = other.width;
        self.height = other.height;
    }

    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.width = 0;
        self.height = 0;
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-role flags, used both for pending updates and for sets of live roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFlags {
    pub local: bool,
    pub remote: bool,
    pub extended: bool,
}

/// Which stream buffers hold data the render thread has not drawn yet.
pub type UpdateRequired = RoleFlags;

impl RoleFlags {
    #[must_use]
    pub fn get(&self, role: StreamRole) -> bool {
        match role {
            StreamRole::Local => self.local,
            StreamRole::Remote => self.remote,
            StreamRole::Extended => self.extended,
        }
    }

    pub fn set(&mut self, role: StreamRole, value: bool) {
        match role {
            StreamRole::Local => self.local = value,
            StreamRole::Remote => self.remote = value,
            StreamRole::Extended => self.extended = value,
        }
    }

    #[must_use]
    pub fn any(&self) -> bool {
        self.local || self.remote || self.extended
    }

    /// Whether every role set in `self` is also set in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &RoleFlags) -> bool {
        StreamRole::ALL
            .iter()
            .all(|role| !self.get(*role) || other.get(*role))
    }
}

/// Statistics about frame store operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStoreStats {
    /// Total frames stored by producers.
    pub frames_stored: u64,
    /// Frames replaced before the render thread drew them.
    pub frames_overwritten: u64,
    /// Render passes that displayed at least one frame.
    pub frames_rendered: u64,
}

/// Lock-free counters behind [`FrameStoreStats`].
#[derive(Debug, Default)]
pub struct StoreCounters {
    stored: AtomicU64,
    overwritten: AtomicU64,
    rendered: AtomicU64,
}

impl StoreCounters {
    pub fn record_store(&self, overwritten: bool) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        if overwritten {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the updated rendered count.
    pub fn record_render(&self) -> u64 {
        self.rendered.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn snapshot(&self) -> FrameStoreStats {
        FrameStoreStats {
            frames_stored: self.stored.load(Ordering::Relaxed),
            frames_overwritten: self.overwritten.load(Ordering::Relaxed),
            frames_rendered: self.rendered.load(Ordering::Relaxed),
        }
    }
}

/// One buffer per stream role plus the pending update flags.
///
/// Not synchronized on its own; it lives inside the manager's shared lock.
#[derive(Debug, Default)]
pub struct FrameStore {
    buffers: [FrameBuffer; 3],
    updates: UpdateRequired,
}

impl FrameStore {
    /// Store a frame for `role` and raise its update flag.
    ///
    /// Returns `true` when an undrawn frame for the same role was replaced.
    pub fn store(&mut self, role: StreamRole, data: &[u8], width: u32, height: u32) -> bool {
        let overwritten = self.updates.get(role);
        self.buffers[role.index()].write(data, width, height);
        self.updates.set(role, true);
        overwritten
    }

    /// Take the pending update flags, leaving all of them cleared.
    pub fn take_updates(&mut self) -> UpdateRequired {
        std::mem::take(&mut self.updates)
    }

    #[must_use]
    pub fn updates(&self) -> UpdateRequired {
        self.updates
    }

    #[must_use]
    pub fn buffer(&self, role: StreamRole) -> &FrameBuffer {
        &self.buffers[role.index()]
    }

    /// Whether the role has delivered at least one frame since the last clear.
    #[must_use]
    pub fn has_frame(&self, role: StreamRole) -> bool {
        !self.buffers[role.index()].is_empty()
    }

    /// Release every buffer and drop pending updates.
    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.updates = UpdateRequired::default();
    }
}
