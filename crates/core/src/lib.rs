//! Core emulation primitives shared across the toolkit.

pub mod cpu_z80;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A rendered frame in ARGB8888, row-major.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_initialization() {
        let f = types::Frame::new(160, 144);
        assert_eq!(f.pixels.len(), 160 * 144);
        assert_eq!(f.width, 160);
        assert_eq!(f.height, 144);
    }

    #[test]
    fn frame_serializes() {
        let f = types::Frame::new(2, 2);
        let s = serde_json::to_string(&f).expect("serialize");
        let f2: types::Frame = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(f2.pixels, f.pixels);
    }
}
