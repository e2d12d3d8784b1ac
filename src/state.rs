//! Double buffer of per-frame query buffers.

use crate::buffer::{AsyncTraceData, BufferPhase};

/// Two buffers indexed by `frame % 2`: the one accepting this frame's
/// queries and the one holding last frame's results.
pub struct WorldAsyncTraceState {
    buffers: [AsyncTraceData; 2],
    current_frame: u32,
    /// False until the first frame boundary.
    has_previous: bool,
}

impl Default for WorldAsyncTraceState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldAsyncTraceState {
    pub fn new() -> Self {
        Self {
            buffers: [
                AsyncTraceData::new(0, BufferPhase::Open),
                AsyncTraceData::new(u32::MAX, BufferPhase::Closed),
            ],
            current_frame: 0,
            has_previous: false,
        }
    }

    #[inline]
    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// The frame whose results are (or will be) readable. `None` before the
    /// first boundary.
    #[inline]
    pub fn previous_frame(&self) -> Option<u32> {
        self.has_previous
            .then(|| self.current_frame.wrapping_sub(1))
    }

    #[inline]
    fn slot(frame: u32) -> usize {
        (frame % 2) as usize
    }

    #[inline]
    pub fn buffer_for_frame(&self, frame: u32) -> &AsyncTraceData {
        &self.buffers[Self::slot(frame)]
    }

    #[inline]
    pub(crate) fn buffer_for_frame_mut(&mut self, frame: u32) -> &mut AsyncTraceData {
        &mut self.buffers[Self::slot(frame)]
    }

    #[inline]
    pub fn current_buffer(&self) -> &AsyncTraceData {
        self.buffer_for_frame(self.current_frame)
    }

    #[inline]
    pub(crate) fn current_buffer_mut(&mut self) -> &mut AsyncTraceData {
        self.buffer_for_frame_mut(self.current_frame)
    }

    pub fn previous_buffer(&self) -> Option<&AsyncTraceData> {
        self.previous_frame().map(|f| self.buffer_for_frame(f))
    }

    pub(crate) fn previous_buffer_mut(&mut self) -> Option<&mut AsyncTraceData> {
        let frame = self.previous_frame()?;
        Some(self.buffer_for_frame_mut(frame))
    }

    /// Moves to the next frame and recycles its buffer. The caller must have
    /// harvested whatever that buffer held.
    pub(crate) fn advance(&mut self) {
        self.current_frame = self.current_frame.wrapping_add(1);
        self.has_previous = true;
        let frame = self.current_frame;
        self.current_buffer_mut().reset(frame);
    }

    pub(crate) fn buffers_mut(&mut self) -> impl Iterator<Item = &mut AsyncTraceData> {
        self.buffers.iter_mut()
    }
}
