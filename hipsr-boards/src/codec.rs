//! Pure spectrum assembly: stitch raw BRAM blocks into frequency-ordered
//! arrays and squash full spectra into GUI previews. No I/O, no shared state.

use byteorder::{BigEndian, ByteOrder};

use hipsr_types::{BeamSpectrum, FlavourDescriptor, PreviewFrame, PREVIEW_BINS};

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("block of {nbytes} bytes is not a whole number of 32-bit words")]
    Misaligned { nbytes: usize },
    #[error("interleaved blocks differ in length")]
    UnevenBlocks,
    #[error("no blocks to stitch")]
    NoBlocks,
    #[error("stitched array has {actual} channels, flavour wants {expected}")]
    ChannelCount { expected: usize, actual: usize },
}

/// Raw reads for one beam at one integration, before assembly.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub xx: Vec<Vec<u8>>,
    pub yy: Vec<Vec<u8>>,
    pub re_xy: Vec<Vec<u8>>,
    pub im_xy: Vec<Vec<u8>>,
    pub fft_of: u32,
    pub adc_clip: u32,
}

/// Stitch the BRAM blocks of one polarisation into frequency order.
///
/// Blocks hold big-endian unsigned 32-bit words. A polarisation split over n
/// BRAMs stores channel `c` in block `c % n` at word `c / n`, so the blocks
/// are interleaved word by word to recover frequency order.
pub fn stitch(blocks: &[Vec<u8>]) -> Result<Vec<u32>, CodecError> {
    let n = blocks.len();
    if n == 0 {
        return Err(CodecError::NoBlocks);
    }
    let nbytes = blocks[0].len();
    if nbytes % 4 != 0 {
        return Err(CodecError::Misaligned { nbytes });
    }
    if blocks.iter().any(|b| b.len() != nbytes) {
        return Err(CodecError::UnevenBlocks);
    }
    let words_per_block = nbytes / 4;
    let mut out = vec![0u32; words_per_block * n];
    for (b, block) in blocks.iter().enumerate() {
        for w in 0..words_per_block {
            out[w * n + b] = BigEndian::read_u32(&block[w * 4..w * 4 + 4]);
        }
    }
    Ok(out)
}

/// Assemble one [`BeamSpectrum`] from the raw reads of one capture.
pub fn decode(
    desc: &FlavourDescriptor,
    raw: RawCapture,
    id: u64,
    timestamp: f64,
) -> Result<BeamSpectrum, CodecError> {
    let assemble = |blocks: &[Vec<u8>]| -> Result<Vec<u32>, CodecError> {
        let arr = stitch(blocks)?;
        if arr.len() != desc.num_channels {
            return Err(CodecError::ChannelCount {
                expected: desc.num_channels,
                actual: arr.len(),
            });
        }
        Ok(arr)
    };
    Ok(BeamSpectrum {
        id,
        timestamp,
        xx: assemble(&raw.xx)?,
        yy: assemble(&raw.yy)?,
        re_xy: assemble(&raw.re_xy)?,
        im_xy: assemble(&raw.im_xy)?,
        fft_of: raw.fft_of,
        adc_clip: raw.adc_clip,
    })
}

/// Reduce a full spectrum to a [`PreviewFrame`] by non-overlapping mean
/// bucketing down to [`PREVIEW_BINS`] bins.
pub fn preview(spectrum: &BeamSpectrum) -> PreviewFrame {
    PreviewFrame {
        xx: squash(&spectrum.xx, PREVIEW_BINS),
        yy: squash(&spectrum.yy, PREVIEW_BINS),
        timestamp: spectrum.timestamp,
    }
}

fn squash(data: &[u32], bins: usize) -> Vec<u32> {
    if data.len() <= bins {
        return data.to_vec();
    }
    let width = data.len() / bins;
    data.chunks(width)
        .take(bins)
        .map(|chunk| {
            let sum: u64 = chunk.iter().map(|&v| u64::from(v)).sum();
            (sum / chunk.len() as u64) as u32
        })
        .collect()
}
