//! LZMA decoder for packed image regions.
//!
//! Every packed unit is a raw LZMA stream (no header) terminated by an end
//! marker.  All units of an image share one set of properties and one
//! probability model allocation; the model is reset at the start of each
//! unit and the unit's own output is its dictionary.
//!
//! The probability model is a single flat vector laid out the same way as
//! the reference C decoder, so `num_probs` matches what the build-time
//! protector budgets for.

use crate::error::LzmaError;

const NUM_BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u16 = 1 << NUM_BIT_MODEL_TOTAL_BITS;
const NUM_MOVE_BITS: u32 = 5;
const TOP_VALUE: u32 = 1 << 24;

const NUM_STATES: usize = 12;
const NUM_LIT_STATES: usize = 7;
const NUM_POS_BITS_MAX: usize = 4;

const START_POS_MODEL_INDEX: u32 = 4;
const END_POS_MODEL_INDEX: u32 = 14;
const NUM_FULL_DISTANCES: usize = 1 << (END_POS_MODEL_INDEX >> 1);
const NUM_POS_SLOT_BITS: u32 = 6;
const NUM_LEN_TO_POS_STATES: usize = 4;
const NUM_ALIGN_BITS: u32 = 4;
const MATCH_MIN_LEN: usize = 2;

// Length coder sub-layout.
const LEN_CHOICE: usize = 0;
const LEN_CHOICE2: usize = 1;
const LEN_LOW: usize = 2;
const LEN_MID: usize = LEN_LOW + (1 << (NUM_POS_BITS_MAX + 3));
const LEN_HIGH: usize = LEN_MID + (1 << (NUM_POS_BITS_MAX + 3));
const NUM_LEN_PROBS: usize = LEN_HIGH + 256;

// Top-level layout.
const IS_MATCH: usize = 0;
const IS_REP: usize = IS_MATCH + (NUM_STATES << NUM_POS_BITS_MAX);
const IS_REP_G0: usize = IS_REP + NUM_STATES;
const IS_REP_G1: usize = IS_REP_G0 + NUM_STATES;
const IS_REP_G2: usize = IS_REP_G1 + NUM_STATES;
const IS_REP0_LONG: usize = IS_REP_G2 + NUM_STATES;
const POS_SLOT: usize = IS_REP0_LONG + (NUM_STATES << NUM_POS_BITS_MAX);
const SPEC_POS: usize = POS_SLOT + (NUM_LEN_TO_POS_STATES << NUM_POS_SLOT_BITS);
const ALIGN: usize = SPEC_POS + NUM_FULL_DISTANCES - END_POS_MODEL_INDEX as usize;
const LEN_CODER: usize = ALIGN + (1 << NUM_ALIGN_BITS);
const REP_LEN_CODER: usize = LEN_CODER + NUM_LEN_PROBS;
const LITERAL: usize = REP_LEN_CODER + NUM_LEN_PROBS;

const LIT_SIZE: usize = 0x300;

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// The five-byte property block: `(pb * 5 + lp) * 9 + lc`, then the
/// little-endian dictionary size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaProperties {
    pub lc: u32,
    pub lp: u32,
    pub pb: u32,
    pub dict_size: u32,
}

impl LzmaProperties {
    pub const SIZE: usize = 5;

    pub fn decode(data: &[u8]) -> Result<Self, LzmaError> {
        if data.len() < Self::SIZE {
            return Err(LzmaError::InvalidProperties);
        }
        let mut d = u32::from(data[0]);
        if d >= 9 * 5 * 5 {
            return Err(LzmaError::InvalidProperties);
        }
        let lc = d % 9;
        d /= 9;
        let lp = d % 5;
        let pb = d / 5;
        let dict_size = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        Ok(LzmaProperties { lc, lp, pb, dict_size })
    }

    /// Size of the flat probability model.
    pub fn num_probs(&self) -> usize {
        LITERAL + (LIT_SIZE << (self.lc + self.lp))
    }
}

// ---------------------------------------------------------------------------
// Range decoder
// ---------------------------------------------------------------------------

struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(input: &'a [u8]) -> Result<Self, LzmaError> {
        let mut rc = RangeDecoder {
            input,
            pos: 0,
            range: 0xFFFF_FFFF,
            code: 0,
        };
        for _ in 0..5 {
            rc.code = (rc.code << 8) | u32::from(rc.next()?);
        }
        Ok(rc)
    }

    #[inline]
    fn next(&mut self) -> Result<u8, LzmaError> {
        let b = *self.input.get(self.pos).ok_or(LzmaError::Corrupt(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    fn normalize(&mut self) -> Result<(), LzmaError> {
        if self.range < TOP_VALUE {
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(self.next()?);
        }
        Ok(())
    }

    #[inline]
    fn bit(&mut self, prob: &mut u16) -> Result<u32, LzmaError> {
        let bound = (self.range >> NUM_BIT_MODEL_TOTAL_BITS) * u32::from(*prob);
        let bit = if self.code < bound {
            self.range = bound;
            *prob += (BIT_MODEL_TOTAL - *prob) >> NUM_MOVE_BITS;
            0
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> NUM_MOVE_BITS;
            1
        };
        self.normalize()?;
        Ok(bit)
    }

    fn direct_bits(&mut self, count: u32) -> Result<u32, LzmaError> {
        let mut result = 0u32;
        for _ in 0..count {
            self.range >>= 1;
            let t = if self.code >= self.range {
                self.code -= self.range;
                1
            } else {
                0
            };
            result = (result << 1) | t;
            self.normalize()?;
        }
        Ok(result)
    }

    fn tree(&mut self, probs: &mut [u16], base: usize, bits: u32) -> Result<u32, LzmaError> {
        let mut m = 1usize;
        for _ in 0..bits {
            m = (m << 1) + self.bit(&mut probs[base + m])? as usize;
        }
        Ok((m - (1 << bits)) as u32)
    }

    fn reverse_tree(&mut self, probs: &mut [u16], base: usize, bits: u32) -> Result<u32, LzmaError> {
        let mut m = 1usize;
        let mut symbol = 0u32;
        for i in 0..bits {
            let bit = self.bit(&mut probs[base + m])?;
            m = (m << 1) + bit as usize;
            symbol |= bit << i;
        }
        Ok(symbol)
    }

    fn len(&mut self, probs: &mut [u16], base: usize, pos_state: usize) -> Result<usize, LzmaError> {
        if self.bit(&mut probs[base + LEN_CHOICE])? == 0 {
            return Ok(self.tree(probs, base + LEN_LOW + (pos_state << 3), 3)? as usize);
        }
        if self.bit(&mut probs[base + LEN_CHOICE2])? == 0 {
            return Ok(8 + self.tree(probs, base + LEN_MID + (pos_state << 3), 3)? as usize);
        }
        Ok(16 + self.tree(probs, base + LEN_HIGH, 8)? as usize)
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decoder with one probability model reused for every unit.
pub struct LzmaDecoder {
    props: LzmaProperties,
    probs: Vec<u16>,
}

impl LzmaDecoder {
    /// Allocate the model.  Allocation failure is reported, never aborted.
    pub fn new(props: LzmaProperties) -> Result<Self, LzmaError> {
        let n = props.num_probs();
        let mut probs = Vec::new();
        probs
            .try_reserve_exact(n)
            .map_err(|_| LzmaError::Allocation(n))?;
        probs.resize(n, BIT_MODEL_TOTAL >> 1);
        Ok(LzmaDecoder { props, probs })
    }

    pub fn properties(&self) -> LzmaProperties {
        self.props
    }

    /// Decode one end-marker-terminated stream.  Output past `limit` bytes
    /// is treated as corruption.  Returns the output and the number of
    /// input bytes consumed.
    pub fn decode_unit(&mut self, input: &[u8], limit: usize) -> Result<(Vec<u8>, usize), LzmaError> {
        self.probs.fill(BIT_MODEL_TOTAL >> 1);
        let probs = &mut self.probs[..];

        let lc = self.props.lc;
        let lp_mask = (1usize << self.props.lp) - 1;
        let pb_mask = (1usize << self.props.pb) - 1;

        let mut rc = RangeDecoder::new(input)?;
        let mut out: Vec<u8> = Vec::new();
        let mut state = 0usize;
        let (mut rep0, mut rep1, mut rep2, mut rep3) = (0u32, 0u32, 0u32, 0u32);

        loop {
            let pos_state = out.len() & pb_mask;

            if rc.bit(&mut probs[IS_MATCH + (state << NUM_POS_BITS_MAX) + pos_state])? == 0 {
                let prev = out.last().copied().unwrap_or(0);
                let base = LITERAL
                    + LIT_SIZE * (((out.len() & lp_mask) << lc) + (usize::from(prev) >> (8 - lc)));
                let mut symbol = 1usize;
                if state >= NUM_LIT_STATES {
                    let mut match_byte = copy_source(&out, rep0, rc.pos)?;
                    loop {
                        let match_bit = usize::from(match_byte >> 7) & 1;
                        match_byte <<= 1;
                        let bit = rc.bit(&mut probs[base + ((1 + match_bit) << 8) + symbol])? as usize;
                        symbol = (symbol << 1) | bit;
                        if match_bit != bit || symbol >= 0x100 {
                            break;
                        }
                    }
                }
                while symbol < 0x100 {
                    symbol = (symbol << 1) | rc.bit(&mut probs[base + symbol])? as usize;
                }
                push_checked(&mut out, symbol as u8, limit, rc.pos)?;
                state = if state < 4 {
                    0
                } else if state < 10 {
                    state - 3
                } else {
                    state - 6
                };
                continue;
            }

            let len;
            if rc.bit(&mut probs[IS_REP + state])? == 1 {
                if out.is_empty() {
                    return Err(LzmaError::Corrupt(rc.pos));
                }
                if rc.bit(&mut probs[IS_REP_G0 + state])? == 0 {
                    if rc.bit(&mut probs[IS_REP0_LONG + (state << NUM_POS_BITS_MAX) + pos_state])? == 0 {
                        state = if state < NUM_LIT_STATES { 9 } else { 11 };
                        let b = copy_source(&out, rep0, rc.pos)?;
                        push_checked(&mut out, b, limit, rc.pos)?;
                        continue;
                    }
                } else {
                    let dist;
                    if rc.bit(&mut probs[IS_REP_G1 + state])? == 0 {
                        dist = rep1;
                    } else {
                        if rc.bit(&mut probs[IS_REP_G2 + state])? == 0 {
                            dist = rep2;
                        } else {
                            dist = rep3;
                            rep3 = rep2;
                        }
                        rep2 = rep1;
                    }
                    rep1 = rep0;
                    rep0 = dist;
                }
                len = rc.len(probs, REP_LEN_CODER, pos_state)?;
                state = if state < NUM_LIT_STATES { 8 } else { 11 };
            } else {
                rep3 = rep2;
                rep2 = rep1;
                rep1 = rep0;
                len = rc.len(probs, LEN_CODER, pos_state)?;
                state = if state < NUM_LIT_STATES { 7 } else { 10 };

                let len_to_pos = len.min(NUM_LEN_TO_POS_STATES - 1);
                let slot = rc.tree(probs, POS_SLOT + (len_to_pos << NUM_POS_SLOT_BITS), NUM_POS_SLOT_BITS)?;
                if slot >= START_POS_MODEL_INDEX {
                    let direct = (slot >> 1) - 1;
                    rep0 = (2 | (slot & 1)) << direct;
                    if slot < END_POS_MODEL_INDEX {
                        let base = SPEC_POS + rep0 as usize - slot as usize - 1;
                        rep0 = rep0.wrapping_add(rc.reverse_tree(probs, base, direct)?);
                    } else {
                        rep0 = rep0.wrapping_add(rc.direct_bits(direct - NUM_ALIGN_BITS)? << NUM_ALIGN_BITS);
                        rep0 = rep0.wrapping_add(rc.reverse_tree(probs, ALIGN, NUM_ALIGN_BITS)?);
                    }
                    if rep0 == 0xFFFF_FFFF {
                        return Ok((out, rc.pos));
                    }
                } else {
                    rep0 = slot;
                }
            }

            for _ in 0..len + MATCH_MIN_LEN {
                let b = copy_source(&out, rep0, rc.pos)?;
                push_checked(&mut out, b, limit, rc.pos)?;
            }
        }
    }
}

/// Byte `distance + 1` positions back.
#[inline]
fn copy_source(out: &[u8], distance: u32, at: usize) -> Result<u8, LzmaError> {
    let back = distance as usize + 1;
    if back > out.len() {
        return Err(LzmaError::Corrupt(at));
    }
    Ok(out[out.len() - back])
}

#[inline]
fn push_checked(out: &mut Vec<u8>, b: u8, limit: usize, at: usize) -> Result<(), LzmaError> {
    if out.len() >= limit {
        return Err(LzmaError::Corrupt(at));
    }
    out.push(b);
    Ok(())
}
