use anyhow::Error;
use thiserror::Error;

/// Raw RGB frame captured from a video source.
///
/// Width and height stay fixed for the lifetime of the source that produced
/// the frame. `data` holds `width * height * 3` bytes, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 => 3,
        }
    }
}

impl Frame {
    /// Wrap an RGB8 buffer, rejecting buffers whose length does not match the
    /// dimensions.
    pub fn rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = expected_len(width, height, FrameFormat::Rgb8);
        if width == 0 || height == 0 || data.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                actual: data.len(),
                expected,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format: FrameFormat::Rgb8,
        })
    }

    /// Frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
            format: FrameFormat::Rgb8,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == expected_len(self.width, self.height, self.format)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        let offset = self.offset(x, y)?;
        self.data.get(offset..offset + self.format.bytes_per_pixel())
    }

    pub fn pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut [u8]> {
        let offset = self.offset(x, y)?;
        let bpp = self.format.bytes_per_pixel();
        self.data.get_mut(offset..offset + bpp)
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        Some((y as usize * self.width as usize + x as usize) * bpp)
    }
}

fn expected_len(width: u32, height: u32, format: FrameFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame buffer holds {actual} bytes but {width}x{height} needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        actual: usize,
        expected: usize,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video source {uri:?} is unavailable: {reason}")]
    Unavailable { uri: String, reason: String },
    #[error("video source {uri:?} reached the end of its clip")]
    Exhausted { uri: String },
    #[error("video source {uri:?} is not open")]
    NotOpen { uri: String },
    #[error("failed to read from video source {uri:?}: {reason}")]
    Read { uri: String, reason: String },
    #[error(transparent)]
    Other(#[from] Error),
}

impl SourceError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SourceError::Exhausted { .. })
    }
}

/// Producer of raw frames.
///
/// A source owns its device or file handle. `read_frame` blocks until the next
/// frame is ready. `close` must be safe to call repeatedly and without a prior
/// successful `open`.
pub trait FrameSource: Send {
    /// Human readable identifier (device path, clip path).
    fn describe(&self) -> &str;

    fn open(&mut self) -> Result<(), SourceError>;

    fn read_frame(&mut self) -> Result<Frame, SourceError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> &str {
        (**self).describe()
    }

    fn open(&mut self) -> Result<(), SourceError> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
