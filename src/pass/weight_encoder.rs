// This module defines the seam between pass emission and weight compression. The hardware
// streams weights in stripes: each stripe holds the kernels of a contiguous run of output
// channels (and, when the input depth is split, a run of input channels), preceded by a small
// header. The encoder returns the concatenated stripe payloads together with one metadata
// record per stripe giving its offset and size inside the payload; the emitter registers both
// as constant DRAM buffers and the cost model uses their sizes for weight traffic.
// MaskWeightEncoder is the reference encoder. It packs each stripe as a 4-byte output zero
// point header followed by groups of up to eight elements: one mask byte flagging the
// elements that differ from the weights zero point, then only those elements.

//! Weight stripe encoding.

use crate::graph::{MceOperationData, QuantizationInfo, WeightsFormat};

/// Location of one encoded stripe within [`EncodedWeights::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsMetadata {
    pub data_offset: u32,
    pub data_size: u32,
}

impl WeightsMetadata {
    /// Size of one serialized record.
    pub const SIZE: usize = 8;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedWeights {
    pub data: Vec<u8>,
    pub metadata: Vec<WeightsMetadata>,
}

impl EncodedWeights {
    /// Metadata records as read by the control unit, little-endian.
    pub fn metadata_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.metadata.len() * WeightsMetadata::SIZE);
        for record in &self.metadata {
            bytes.extend_from_slice(&record.data_offset.to_le_bytes());
            bytes.extend_from_slice(&record.data_size.to_le_bytes());
        }
        bytes
    }

    /// Encoded size of the first stripe.
    pub fn first_stripe_size(&self) -> u32 {
        self.metadata.first().map_or(0, |m| m.data_size)
    }
}

/// Compresses the weights of one MCE operation into hardware stripes.
pub trait WeightEncoder {
    /// Encode `weights` (laid out per the operation's weights format) into
    /// stripes of `stripe_depth` output channels and `stripe_size` input
    /// channels. `quantization` is the output quantization of the pass.
    fn encode(
        &self,
        mce: &MceOperationData,
        weights: &[u8],
        stripe_depth: u32,
        stripe_size: u32,
        quantization: &QuantizationInfo,
    ) -> EncodedWeights;
}

/// Zero-point mask packing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskWeightEncoder;

impl MaskWeightEncoder {
    pub fn new() -> Self {
        Self
    }

    fn pack_stripe(out: &mut Vec<u8>, elements: &[u8], weights_zero_point: u8, output_zero_point: i32) {
        out.extend_from_slice(&output_zero_point.to_le_bytes());
        for group in elements.chunks(8) {
            let mask = group
                .iter()
                .enumerate()
                .filter(|(_, &value)| value != weights_zero_point)
                .fold(0u8, |mask, (bit, _)| mask | (1 << bit));
            out.push(mask);
            out.extend(group.iter().copied().filter(|&value| value != weights_zero_point));
        }
    }
}

impl WeightEncoder for MaskWeightEncoder {
    fn encode(
        &self,
        mce: &MceOperationData,
        weights: &[u8],
        stripe_depth: u32,
        stripe_size: u32,
        quantization: &QuantizationInfo,
    ) -> EncodedWeights {
        let [kh, kw, d2, d3] = mce.weights_info.dimensions;
        let weights_zero_point = mce.weights_info.quantization.zero_point as u8;
        let at = |index: u32| weights.get(index as usize).copied().unwrap_or(weights_zero_point);

        // (output channels, input channels visited per output channel)
        let (num_outputs, num_inputs) = match mce.weights_info.format {
            WeightsFormat::Hwio => (d3, d2),
            WeightsFormat::Hwim => (d2 * d3, 1),
            WeightsFormat::Nhwc => panic!("weights must be HWIO or HWIM"),
        };
        let stripe_depth = stripe_depth.max(1);
        let stripe_size = if stripe_size == 0 { num_inputs } else { stripe_size.min(num_inputs) };

        let mut encoded = EncodedWeights::default();
        let mut elements = Vec::new();

        for out_start in (0..num_outputs).step_by(stripe_depth as usize) {
            let out_end = (out_start + stripe_depth).min(num_outputs);
            for in_start in (0..num_inputs).step_by(stripe_size.max(1) as usize) {
                let in_end = (in_start + stripe_size).min(num_inputs);

                elements.clear();
                for o in out_start..out_end {
                    for y in 0..kh {
                        for x in 0..kw {
                            match mce.weights_info.format {
                                WeightsFormat::Hwio => {
                                    for i in in_start..in_end {
                                        elements.push(at(((y * kw + x) * d2 + i) * d3 + o));
                                    }
                                }
                                _ => {
                                    // Output channel o is input channel o / M, multiplier o % M.
                                    let (c, m) = (o / d3, o % d3);
                                    elements.push(at(((y * kw + x) * d2 + c) * d3 + m));
                                }
                            }
                        }
                    }
                }

                let data_offset = encoded.data.len() as u32;
                Self::pack_stripe(&mut encoded.data, &elements, weights_zero_point, quantization.zero_point);
                encoded.metadata.push(WeightsMetadata {
                    data_offset,
                    data_size: encoded.data.len() as u32 - data_offset,
                });
            }
        }

        log::trace!(
            "encoded {} weight bytes into {} stripes ({} bytes)",
            weights.len(),
            encoded.metadata.len(),
            encoded.data.len()
        );
        encoded
    }
}
