use std::ops::Range;

/// How a file of `file_len` bytes maps onto data frames and segment videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationPlan {
    pub file_len: u64,
    pub slice_len: u64,
    pub total_frames: u64,
    pub frames_per_segment: u64,
    pub segment_count: u64,
}

impl SegmentationPlan {
    /// Inputs are validated by the caller; zero slice length or fps never
    /// reach here.
    pub fn new(file_len: u64, slice_len: usize, fps: u32, max_segment_seconds: u64) -> Self {
        let slice_len = (slice_len as u64).max(1);
        let frames_per_segment = (fps as u64).saturating_mul(max_segment_seconds).max(1);
        let total_frames = file_len.div_ceil(slice_len);
        // An empty file still gets one segment carrying only its index frame.
        let segment_count = total_frames.div_ceil(frames_per_segment).max(1);

        Self {
            file_len,
            slice_len,
            total_frames,
            frames_per_segment,
            segment_count,
        }
    }

    pub fn is_segmented(&self) -> bool {
        self.total_frames > self.frames_per_segment
    }

    pub fn segment_bytes(&self) -> u64 {
        self.slice_len.saturating_mul(self.frames_per_segment)
    }

    /// Byte range covered by segment `s`.
    pub fn segment_range(&self, s: u64) -> Range<u64> {
        let per = self.segment_bytes();
        let start = s.saturating_mul(per).min(self.file_len);
        let end = s.saturating_add(1).saturating_mul(per).min(self.file_len);
        start..end
    }

    /// Number of data frames carried by segment `s`.
    pub fn segment_frames(&self, s: u64) -> u64 {
        let r = self.segment_range(s);
        (r.end - r.start).div_ceil(self.slice_len)
    }

    pub fn segments(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.segment_count).map(move |s| self.segment_range(s))
    }

    /// Playback length in whole seconds at `fps`, header frames excluded.
    pub fn duration_secs(&self, fps: u32) -> u64 {
        self.total_frames.div_ceil(fps.max(1) as u64)
    }
}
