//! Sketch compilation boundary
//!
//! Building a sketch is pluggable behind the [Compiler] trait so that a
//! real cross-compiler toolchain (arduino-cli, esp-idf, ...) can be
//! dropped in. The built-in [MockCompiler] simulates the build: it waits
//! a configurable amount of time and produces a synthetic firmware
//! artifact filled with random bytes, which is what gets written to the
//! device in simulated workflows.

use std::{thread::sleep, time::Duration};

use log::{debug, info};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use crate::{board::Board, sketch::Sketch, Error};

/// Flash offset ESP application images are written at.
pub const DEFAULT_FLASH_OFFSET: u32 = 0x1_0000;

/// Default simulated build time.
pub const DEFAULT_BUILD_DELAY: Duration = Duration::from_secs(2);

/// Default size of the synthetic firmware image.
pub const DEFAULT_ARTIFACT_SIZE: usize = 64 * 1024;

/// A flashable firmware image produced by a build.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// FQBN of the board this image was built for.
    pub fqbn: String,
    /// The image bytes.
    pub data: Vec<u8>,
    /// Address the image must be written at.
    pub flash_offset: u32,
}

/// Turns sketch source into a flashable [Artifact].
pub trait Compiler {
    fn build(&mut self, sketch: &Sketch, board: &Board) -> Result<Artifact, Error>;
}

/// Simulated compiler producing a placeholder artifact.
pub struct MockCompiler {
    delay: Duration,
    size: usize,
    seed: Option<u64>,
}

impl MockCompiler {
    pub fn new() -> Self {
        MockCompiler {
            delay: DEFAULT_BUILD_DELAY,
            size: DEFAULT_ARTIFACT_SIZE,
            seed: None,
        }
    }

    /// Override the simulated build time.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the artifact size.
    pub fn artifact_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Seed the artifact contents, making builds reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for MockCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for MockCompiler {
    fn build(&mut self, sketch: &Sketch, board: &Board) -> Result<Artifact, Error> {
        if sketch.code.trim().is_empty() {
            return Err(Error::Build {
                sketch: sketch.name.clone(),
                reason: "sketch contains no code".into(),
            });
        }

        info!("Compiling '{}' for {}", sketch.name, board);
        sleep(self.delay);

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut data = vec![0; self.size];
        rng.fill_bytes(&mut data);

        debug!(
            "Produced {} byte artifact for {}",
            data.len(),
            board.fqbn
        );

        Ok(Artifact {
            fqbn: board.fqbn.clone(),
            data,
            flash_offset: DEFAULT_FLASH_OFFSET,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::default_board;

    fn instant_compiler() -> MockCompiler {
        MockCompiler::new().delay(Duration::ZERO)
    }

    #[test]
    fn produces_an_artifact_of_the_requested_size() {
        let mut compiler = instant_compiler().artifact_size(512);
        let artifact = compiler
            .build(&Sketch::blink(), &default_board())
            .unwrap();

        assert_eq!(artifact.data.len(), 512);
        assert_eq!(artifact.fqbn, "esp32:esp32:esp32");
        assert_eq!(artifact.flash_offset, DEFAULT_FLASH_OFFSET);
    }

    #[test]
    fn seeded_builds_are_reproducible() {
        let mut a = instant_compiler().seed(42).artifact_size(128);
        let mut b = instant_compiler().seed(42).artifact_size(128);

        let sketch = Sketch::blink();
        let board = default_board();
        assert_eq!(
            a.build(&sketch, &board).unwrap().data,
            b.build(&sketch, &board).unwrap().data
        );
    }

    #[test]
    fn empty_sketches_are_rejected() {
        let mut compiler = instant_compiler();
        let empty = Sketch::new("2", "Empty.ino", "  \n ");

        assert!(matches!(
            compiler.build(&empty, &default_board()),
            Err(Error::Build { .. })
        ));
    }
}
