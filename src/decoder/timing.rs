// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoder::CodecFrame;

const NSECS_PER_SEC: u64 = 1_000_000_000;

/// Timestamp bookkeeping of a decoder.
///
/// The timestamp of the first sync point frame anchors the stream: frames are expected at
/// multiples of the frame duration from it, and frames synthesized by double rate deinterlacing
/// are stamped relative to it.
#[derive(Debug)]
pub(crate) struct Timing {
    /// Timestamp of the first sync point frame since the last reset.
    pts_offset: Option<u64>,
    fps_n: u32,
    fps_d: u32,
    /// Duration of one frame at the stream frame rate, truncated to the nanosecond.
    frame_duration: u64,
    /// Duration of the last input frame, if it had one.
    input_duration: Option<u64>,
    /// Time elapsed since `pts_offset` over the synthesized frames.
    current_pts: u64,
}

impl Timing {
    /// `fps_n` must not be zero.
    pub fn new(fps_n: u32, fps_d: u32) -> Self {
        Self {
            pts_offset: None,
            fps_n,
            fps_d,
            frame_duration: fps_d as u64 * NSECS_PER_SEC / fps_n.max(1) as u64,
            input_duration: None,
            current_pts: 0,
        }
    }

    pub fn frame_duration(&self) -> u64 {
        self.frame_duration
    }

    pub fn pts_offset(&self) -> Option<u64> {
        self.pts_offset
    }

    /// Takes note of the timing of a new input frame.
    pub fn observe(&mut self, frame: &CodecFrame) {
        if self.pts_offset.is_none() && frame.sync_point {
            self.pts_offset = frame.pts;
        }
        if frame.duration.is_some() {
            self.input_duration = frame.duration;
        }
    }

    /// Timestamp and duration of the next frame synthesized out of a field of the input.
    ///
    /// Each field lasts half of the duration of the input frame, or one frame at the stream rate
    /// if the input frames carry no duration.
    pub fn next_field(&mut self) -> (u64, u64) {
        let duration = self
            .input_duration
            .map(|d| d / 2)
            .unwrap_or(self.frame_duration);
        let pts = self.pts_offset.unwrap_or(0) + self.current_pts;
        self.current_pts += duration;

        (pts, duration)
    }

    /// Whether `pts` falls on a frame boundary, before or after the anchor.
    ///
    /// Boundaries are computed exactly from the frame rate. Timestamps rounded to the nanosecond,
    /// or accumulated from truncated durations, are off by less than 1ns per frame and still count
    /// as aligned.
    pub fn is_aligned(&self, pts: u64) -> bool {
        if self.fps_n == 0 || self.fps_d == 0 {
            return true;
        }

        let distance = pts.abs_diff(self.pts_offset.unwrap_or(0)) as u128;
        // One frame lasts `period / fps_n` nanoseconds.
        let period = self.fps_d as u128 * NSECS_PER_SEC as u128;
        let scaled = distance * self.fps_n as u128;
        let frames = scaled / period;
        let rem = scaled % period;
        let tolerance = (frames + 1) * self.fps_n as u128;

        rem < tolerance || period - rem < tolerance
    }

    pub fn reset(&mut self) {
        self.pts_offset = None;
        self.current_pts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn frame(pts: Option<u64>, duration: Option<u64>, sync_point: bool) -> CodecFrame {
        CodecFrame::new(0, pts, duration, sync_point, Vec::new())
    }

    #[test]
    fn anchored_on_first_sync_point() {
        let mut timing = Timing::new(30, 1);
        assert_eq!(timing.frame_duration(), 33_333_333);

        timing.observe(&frame(Some(10 * MS), None, false));
        assert_eq!(timing.pts_offset(), None);
        timing.observe(&frame(None, None, true));
        assert_eq!(timing.pts_offset(), None);
        timing.observe(&frame(Some(20 * MS), None, true));
        timing.observe(&frame(Some(40 * MS), None, true));
        assert_eq!(timing.pts_offset(), Some(20 * MS));

        assert!(timing.is_aligned(20 * MS + 2 * 33_333_333));
        assert!(!timing.is_aligned(30 * MS));

        timing.reset();
        assert_eq!(timing.pts_offset(), None);
        assert!(timing.is_aligned(33_333_333));
    }

    #[test]
    fn frames_before_anchor_are_aligned() {
        let mut timing = Timing::new(30, 1);
        let duration = timing.frame_duration();
        timing.observe(&frame(Some(3 * duration), None, true));

        // Leading pictures of an open GOP are presented before the sync point.
        assert!(timing.is_aligned(2 * duration));
        assert!(timing.is_aligned(0));
        assert!(!timing.is_aligned(2 * duration + 10 * MS));
    }

    #[test]
    fn fractional_rates_are_aligned() {
        let mut timing = Timing::new(30000, 1001);
        assert_eq!(timing.frame_duration(), 33_366_666);
        timing.observe(&frame(Some(0), None, true));

        // Exact boundaries rounded to the nanosecond.
        for (i, pts) in [33_366_667, 66_733_333, 100_100_000, 3_003_000_000]
            .into_iter()
            .enumerate()
        {
            assert!(timing.is_aligned(pts), "boundary {i} at {pts}");
        }
        // Boundaries accumulated from the truncated duration.
        assert!(timing.is_aligned(3 * 33_366_666));
        assert!(timing.is_aligned(90 * 33_366_666));

        assert!(!timing.is_aligned(50 * MS));
        assert!(!timing.is_aligned(100_100_000 + MS));
    }

    #[test]
    fn fields_split_input_duration() {
        let mut timing = Timing::new(60000, 1001);
        timing.observe(&frame(Some(0), Some(33 * MS), true));

        assert_eq!(timing.next_field(), (0, 16_500_000));
        assert_eq!(timing.next_field(), (16_500_000, 16_500_000));
        assert_eq!(timing.next_field(), (33 * MS, 16_500_000));
    }

    #[test]
    fn fields_without_input_duration() {
        let mut timing = Timing::new(60, 1);
        timing.observe(&frame(Some(100 * MS), None, true));

        assert_eq!(timing.next_field(), (100 * MS, 16_666_666));
        assert_eq!(timing.next_field(), (100 * MS + 16_666_666, 16_666_666));
    }
}
