//! DTS reordering between demux and RTMP.
//!
//! An AAC PES in MPEG-PS often carries several logical frames, so audio
//! timestamps run ahead of (or behind) the video within one pack. Frames are
//! therefore parked in a DTS-ordered map and only released once at least one
//! audio and one video frame are buffered, at which point the lowest DTS
//! goes out first.

use std::collections::BTreeMap;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
}

/// One RTMP-ready frame: a complete audio or video tag payload.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    /// Milliseconds, as sent on the RTMP chunk stream.
    pub timestamp: u32,
    pub payload: Bytes,
}

/// The DTS-ordered holding queue.
#[derive(Default)]
pub struct MpegpsQueue {
    msgs: BTreeMap<u64, MediaFrame>,
    nb_audios: usize,
    nb_videos: usize,
}

impl MpegpsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// Insert a frame at its DTS; equal timestamps keep arrival order by
    /// nudging the key forward one tick.
    pub fn push(&mut self, dts: u64, frame: MediaFrame) {
        let mut key = dts;
        while self.msgs.contains_key(&key) {
            key += 1;
        }
        match frame.kind {
            FrameKind::Audio => self.nb_audios += 1,
            FrameKind::Video => self.nb_videos += 1,
        }
        self.msgs.insert(key, frame);
    }

    /// The lowest-DTS frame, once both kinds are represented.
    pub fn dequeue(&mut self) -> Option<MediaFrame> {
        if self.nb_audios == 0 || self.nb_videos == 0 {
            return None;
        }
        let (_, frame) = self.msgs.pop_first()?;
        match frame.kind {
            FrameKind::Audio => self.nb_audios -= 1,
            FrameKind::Video => self.nb_videos -= 1,
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameKind, timestamp: u32) -> MediaFrame {
        MediaFrame { kind, timestamp, payload: Bytes::new() }
    }

    #[test]
    fn holds_frames_until_both_kinds_buffered() {
        let mut q = MpegpsQueue::new();
        q.push(100, frame(FrameKind::Video, 100));
        assert!(q.dequeue().is_none());

        q.push(90, frame(FrameKind::Audio, 90));
        let out = q.dequeue().unwrap();
        assert_eq!(out.kind, FrameKind::Audio);
        assert_eq!(out.timestamp, 90);

        // One kind left: hold again.
        assert!(q.dequeue().is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn releases_in_dts_order() {
        let mut q = MpegpsQueue::new();
        q.push(300, frame(FrameKind::Video, 300));
        q.push(100, frame(FrameKind::Audio, 100));
        q.push(200, frame(FrameKind::Audio, 200));

        assert_eq!(q.dequeue().unwrap().timestamp, 100);
        assert_eq!(q.dequeue().unwrap().timestamp, 200);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn duplicate_dts_keeps_arrival_order() {
        let mut q = MpegpsQueue::new();
        q.push(50, frame(FrameKind::Audio, 1));
        q.push(50, frame(FrameKind::Audio, 2));
        q.push(50, frame(FrameKind::Video, 3));

        assert_eq!(q.dequeue().unwrap().timestamp, 1);
        assert_eq!(q.dequeue().unwrap().timestamp, 2);
        assert!(q.dequeue().is_none());
    }
}
