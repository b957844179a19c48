//! A minimal EVM interpreter, just big enough to execute compiled
//! dispatchers and simple function bodies in tests.

use std::collections::{HashMap, HashSet};

use ethereum_types::U256;
use sha3::{Digest, Keccak256};

/// Why execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `STOP`.
    Stop,
    /// `RETURN` with the returned bytes.
    Return(Vec<u8>),
    /// `REVERT` with the revert payload.
    Revert(Vec<u8>),
    /// `INVALID`, a bad jump, a stack underflow, or an unsupported opcode.
    Invalid,
    /// Execution arrived at a watched `JUMPDEST`.
    ReachedWatchpoint(usize),
    /// The step budget ran out.
    StepLimit,
}

const STEP_LIMIT: usize = 1_000_000;

/// The interpreter.
#[derive(Debug, Clone)]
pub struct Evm {
    code: Vec<u8>,
    calldata: Vec<u8>,
    callvalue: U256,
    caller: U256,
    /// Operand stack, bottom first.
    pub stack: Vec<U256>,
    memory: Vec<u8>,
    /// Persistent storage.
    pub storage: HashMap<U256, U256>,
    /// Transient storage.
    pub transient: HashMap<U256, U256>,
    jumpdests: HashSet<usize>,
    pc: usize,
}

fn to_signed(x: U256) -> (bool, U256) {
    if x.bit(255) {
        (true, (!x).overflowing_add(U256::one()).0)
    } else {
        (false, x)
    }
}

fn from_signed(negative: bool, magnitude: U256) -> U256 {
    if negative {
        (!magnitude).overflowing_add(U256::one()).0
    } else {
        magnitude
    }
}

fn signed_lt(a: U256, b: U256) -> bool {
    match (a.bit(255), b.bit(255)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

impl Evm {
    /// Interpreter over `code` with empty calldata.
    pub fn new(code: Vec<u8>) -> Self {
        let mut jumpdests = HashSet::new();
        let mut i = 0;
        while i < code.len() {
            let byte = code[i];
            if byte == 0x5B {
                jumpdests.insert(i);
            }
            i += 1 + vyper_asm::immediate_len(byte);
        }
        Evm {
            code,
            calldata: Vec::new(),
            callvalue: U256::zero(),
            caller: U256::zero(),
            stack: Vec::new(),
            memory: Vec::new(),
            storage: HashMap::new(),
            transient: HashMap::new(),
            jumpdests,
            pc: 0,
        }
    }

    /// Set the calldata.
    pub fn with_calldata(mut self, calldata: Vec<u8>) -> Self {
        self.calldata = calldata;
        self
    }

    /// Set the call value.
    pub fn with_callvalue(mut self, value: U256) -> Self {
        self.callvalue = value;
        self
    }

    /// Set the caller address.
    pub fn with_caller(mut self, caller: U256) -> Self {
        self.caller = caller;
        self
    }

    /// Run to completion.
    pub fn run(&mut self) -> Outcome {
        self.run_until(&HashSet::new())
    }

    /// Run until halting or reaching a watched `JUMPDEST`.
    pub fn run_until(&mut self, watch: &HashSet<usize>) -> Outcome {
        for _ in 0..STEP_LIMIT {
            if watch.contains(&self.pc) && self.code.get(self.pc) == Some(&0x5B)
            {
                return Outcome::ReachedWatchpoint(self.pc);
            }
            match self.step() {
                Ok(None) => {}
                Ok(Some(outcome)) => return outcome,
                Err(()) => return Outcome::Invalid,
            }
        }
        Outcome::StepLimit
    }

    fn pop(&mut self) -> Result<U256, ()> {
        self.stack.pop().ok_or(())
    }

    fn push(&mut self, value: U256) {
        self.stack.push(value);
    }

    fn mem_slice(&mut self, offset: usize, len: usize) -> &mut [u8] {
        let end = offset + len;
        if self.memory.len() < end {
            self.memory.resize(end.next_multiple_of(32).max(end), 0);
        }
        &mut self.memory[offset..end]
    }

    fn binary(&mut self, f: impl Fn(U256, U256) -> U256) -> Result<(), ()> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(f(a, b));
        Ok(())
    }

    // one instruction; Ok(Some(..)) halts
    fn step(&mut self) -> Result<Option<Outcome>, ()> {
        let Some(&op) = self.code.get(self.pc) else {
            // running off the end of code is a STOP
            return Ok(Some(Outcome::Stop));
        };
        self.pc += 1;

        match op {
            0x00 => return Ok(Some(Outcome::Stop)),
            0x01 => self.binary(|a, b| a.overflowing_add(b).0)?,
            0x02 => self.binary(|a, b| a.overflowing_mul(b).0)?,
            0x03 => self.binary(|a, b| a.overflowing_sub(b).0)?,
            0x04 => self.binary(|a, b| {
                if b.is_zero() {
                    U256::zero()
                } else {
                    a / b
                }
            })?,
            0x05 => self.binary(|a, b| {
                if b.is_zero() {
                    return U256::zero();
                }
                let (an, am) = to_signed(a);
                let (bn, bm) = to_signed(b);
                from_signed(an != bn, am / bm)
            })?,
            0x06 => self.binary(|a, b| {
                if b.is_zero() {
                    U256::zero()
                } else {
                    a % b
                }
            })?,
            0x07 => self.binary(|a, b| {
                if b.is_zero() {
                    return U256::zero();
                }
                let (an, am) = to_signed(a);
                let (_, bm) = to_signed(b);
                from_signed(an, am % bm)
            })?,
            0x0A => self.binary(|a, b| a.overflowing_pow(b).0)?,
            0x10 => self.binary(|a, b| bool_word(a < b))?,
            0x11 => self.binary(|a, b| bool_word(a > b))?,
            0x12 => self.binary(|a, b| bool_word(signed_lt(a, b)))?,
            0x13 => self.binary(|a, b| bool_word(signed_lt(b, a)))?,
            0x14 => self.binary(|a, b| bool_word(a == b))?,
            0x15 => {
                let a = self.pop()?;
                self.push(bool_word(a.is_zero()));
            }
            0x16 => self.binary(|a, b| a & b)?,
            0x17 => self.binary(|a, b| a | b)?,
            0x18 => self.binary(|a, b| a ^ b)?,
            0x19 => {
                let a = self.pop()?;
                self.push(!a);
            }
            0x1A => self.binary(|i, x| {
                if i >= U256::from(32) {
                    U256::zero()
                } else {
                    U256::from(x.byte(31 - i.as_usize()))
                }
            })?,
            0x1B => self.binary(|shift, x| {
                if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    x << shift.as_usize()
                }
            })?,
            0x1C => self.binary(|shift, x| {
                if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    x >> shift.as_usize()
                }
            })?,
            0x1D => self.binary(|shift, x| {
                let (neg, _) = to_signed(x);
                if shift >= U256::from(256) {
                    return if neg { !U256::zero() } else { U256::zero() };
                }
                let shifted = x >> shift.as_usize();
                if neg {
                    shifted | !(!U256::zero() >> shift.as_usize())
                } else {
                    shifted
                }
            })?,
            0x20 => {
                let offset = self.pop()?.as_usize();
                let len = self.pop()?.as_usize();
                let data = self.mem_slice(offset, len).to_vec();
                let digest = Keccak256::digest(&data);
                self.push(U256::from_big_endian(&digest));
            }
            0x33 => {
                let caller = self.caller;
                self.push(caller);
            }
            0x34 => {
                let value = self.callvalue;
                self.push(value);
            }
            0x35 => {
                let offset = self.pop()?.as_usize();
                let mut word = [0u8; 32];
                for (i, byte) in word.iter_mut().enumerate() {
                    *byte = self
                        .calldata
                        .get(offset + i)
                        .copied()
                        .unwrap_or(0);
                }
                self.push(U256::from_big_endian(&word));
            }
            0x36 => {
                let len = self.calldata.len();
                self.push(U256::from(len));
            }
            0x38 => {
                let len = self.code.len();
                self.push(U256::from(len));
            }
            0x39 => {
                let dst = self.pop()?.as_usize();
                let src = self.pop()?.as_usize();
                let len = self.pop()?.as_usize();
                let mut bytes = vec![0u8; len];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = self.code.get(src + i).copied().unwrap_or(0);
                }
                self.mem_slice(dst, len).copy_from_slice(&bytes);
            }
            0x42 | 0x43 | 0x3A | 0x32 | 0x46 | 0x47 | 0x5A => {
                // environment values the tests never depend on
                self.push(U256::zero());
            }
            0x50 => {
                self.pop()?;
            }
            0x51 => {
                let offset = self.pop()?.as_usize();
                let word = self.mem_slice(offset, 32).to_vec();
                self.push(U256::from_big_endian(&word));
            }
            0x52 => {
                let offset = self.pop()?.as_usize();
                let value = self.pop()?;
                let mut word = [0u8; 32];
                value.to_big_endian(&mut word);
                self.mem_slice(offset, 32).copy_from_slice(&word);
            }
            0x53 => {
                let offset = self.pop()?.as_usize();
                let value = self.pop()?;
                self.mem_slice(offset, 1)[0] = value.byte(0);
            }
            0x54 => {
                let key = self.pop()?;
                let value =
                    self.storage.get(&key).copied().unwrap_or_default();
                self.push(value);
            }
            0x55 => {
                let key = self.pop()?;
                let value = self.pop()?;
                self.storage.insert(key, value);
            }
            0x56 => {
                let dest = self.pop()?.as_usize();
                if !self.jumpdests.contains(&dest) {
                    return Err(());
                }
                self.pc = dest;
            }
            0x57 => {
                let dest = self.pop()?.as_usize();
                let cond = self.pop()?;
                if !cond.is_zero() {
                    if !self.jumpdests.contains(&dest) {
                        return Err(());
                    }
                    self.pc = dest;
                }
            }
            0x58 => {
                let pc = self.pc - 1;
                self.push(U256::from(pc));
            }
            0x5B => {}
            0x5C => {
                let key = self.pop()?;
                let value =
                    self.transient.get(&key).copied().unwrap_or_default();
                self.push(value);
            }
            0x5D => {
                let key = self.pop()?;
                let value = self.pop()?;
                self.transient.insert(key, value);
            }
            0x5E => {
                let dst = self.pop()?.as_usize();
                let src = self.pop()?.as_usize();
                let len = self.pop()?.as_usize();
                let bytes = self.mem_slice(src, len).to_vec();
                self.mem_slice(dst, len).copy_from_slice(&bytes);
            }
            0x5F => self.push(U256::zero()),
            0x60..=0x7F => {
                let n = (op - 0x5F) as usize;
                let mut word = [0u8; 32];
                for i in 0..n {
                    word[32 - n + i] =
                        self.code.get(self.pc + i).copied().unwrap_or(0);
                }
                self.pc += n;
                self.push(U256::from_big_endian(&word));
            }
            0x80..=0x8F => {
                let n = (op - 0x7F) as usize;
                if self.stack.len() < n {
                    return Err(());
                }
                let value = self.stack[self.stack.len() - n];
                self.push(value);
            }
            0x90..=0x9F => {
                let n = (op - 0x8F) as usize;
                let top = self.stack.len().checked_sub(1).ok_or(())?;
                let other = self.stack.len().checked_sub(n + 1).ok_or(())?;
                self.stack.swap(top, other);
            }
            0xA0..=0xA4 => {
                let n_topics = (op - 0xA0) as usize;
                let _offset = self.pop()?;
                let _len = self.pop()?;
                for _ in 0..n_topics {
                    self.pop()?;
                }
            }
            0xF3 => {
                let offset = self.pop()?.as_usize();
                let len = self.pop()?.as_usize();
                let data = self.mem_slice(offset, len).to_vec();
                return Ok(Some(Outcome::Return(data)));
            }
            0xFD => {
                let offset = self.pop()?.as_usize();
                let len = self.pop()?.as_usize();
                let data = self.mem_slice(offset, len).to_vec();
                return Ok(Some(Outcome::Revert(data)));
            }
            0xFE => return Ok(Some(Outcome::Invalid)),
            _ => return Err(()),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_return() {
        // PUSH1 2 PUSH1 3 ADD PUSH0 MSTORE PUSH1 32 PUSH0 RETURN
        let code = vec![
            0x60, 0x02, 0x60, 0x03, 0x01, 0x5F, 0x52, 0x60, 0x20, 0x5F, 0xF3,
        ];
        let mut evm = Evm::new(code);
        match evm.run() {
            Outcome::Return(data) => {
                assert_eq!(U256::from_big_endian(&data), U256::from(5))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn invalid_jump_target() {
        // PUSH1 3 JUMP (3 is not a JUMPDEST)
        let code = vec![0x60, 0x03, 0x56, 0x00];
        let mut evm = Evm::new(code);
        assert_eq!(evm.run(), Outcome::Invalid);
    }

    #[test]
    fn jumpdest_inside_push_data_does_not_count() {
        // PUSH2 0x5B00; the 0x5B is immediate data, not a jumpdest
        let code = vec![0x61, 0x5B, 0x00, 0x60, 0x01, 0x56];
        let mut evm = Evm::new(code);
        assert_eq!(evm.run(), Outcome::Invalid);
    }

    #[test]
    fn watchpoints_fire_on_jumpdest() {
        // PUSH1 4 JUMP STOP JUMPDEST STOP
        let code = vec![0x60, 0x04, 0x56, 0x00, 0x5B, 0x00];
        let mut evm = Evm::new(code);
        let watch = HashSet::from([4usize]);
        assert_eq!(evm.run_until(&watch), Outcome::ReachedWatchpoint(4));
    }
}
