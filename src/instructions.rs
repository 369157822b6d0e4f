// Execution of both ARM ISAs. Operand fields are pulled straight out of the
// raw word here; the parser only classifies. Memory faults propagate out as
// errors and get vectored by the run loop.

use crate::parser::{decode_arm, decode_thumb, ArmInstr, ThumbInstr};
use crate::processor::{add_overflow, ArmCpu, PsrMode, REG_LR, REG_PC, REG_SP};
use crate::memory::CpuId;
use crate::vfp;
use crate::EmuError;
use log::warn;

pub fn execute_arm(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let cond = instr >> 28;

    if cond == 0xF {
        if instr & 0xFE00_0000 == 0xFA00_0000 {
            return arm_blx_imm(cpu, instr);
        }
        if cpu.id != CpuId::Arm9 && (instr >> 20) == 0xF10 {
            cpu.cps(instr);
            return Ok(());
        }
    }

    if !cpu.meets_condition(cond) {
        return Ok(());
    }

    match decode_arm(instr) {
        ArmInstr::Srs => cpu.srs(instr),
        ArmInstr::Rfe => cpu.rfe(instr),
        ArmInstr::Branch | ArmInstr::BranchLink => arm_b(cpu, instr),
        ArmInstr::BranchExchange => arm_bx(cpu, instr),
        ArmInstr::BranchLinkExchange => arm_blx_reg(cpu, instr),
        ArmInstr::Swi => {
            cpu.swi();
            Ok(())
        }
        ArmInstr::Clz => arm_clz(cpu, instr),
        ArmInstr::Bkpt => Err(EmuError::PrefetchAbort { vaddr: cpu.gpr[REG_PC].wrapping_sub(8) }),
        ArmInstr::Sxtb => arm_sxtb(cpu, instr),
        ArmInstr::Sxth => arm_sxth(cpu, instr),
        ArmInstr::Uxtb => arm_uxtb(cpu, instr),
        ArmInstr::Uxth => arm_uxth(cpu, instr),
        ArmInstr::Rev => arm_rev(cpu, instr),
        ArmInstr::Rev16 => arm_rev16(cpu, instr),
        ArmInstr::DataProcessing => arm_data_processing(cpu, instr),
        ArmInstr::SignedHalfwordMultiply => arm_signed_halfword_multiply(cpu, instr),
        ArmInstr::Multiply => arm_mul(cpu, instr),
        ArmInstr::MultiplyLong => arm_mul_long(cpu, instr),
        ArmInstr::Swap => arm_swp(cpu, instr),
        ArmInstr::LoadByte => arm_load_byte(cpu, instr),
        ArmInstr::StoreByte => arm_store_byte(cpu, instr),
        ArmInstr::LoadWord => arm_load_word(cpu, instr),
        ArmInstr::StoreWord => arm_store_word(cpu, instr),
        ArmInstr::Pld => Ok(()), // no caches emulated
        ArmInstr::LoadHalfword => arm_load_halfword(cpu, instr),
        ArmInstr::StoreHalfword => arm_store_halfword(cpu, instr),
        ArmInstr::LoadSignedByte => arm_load_signed_byte(cpu, instr),
        ArmInstr::LoadSignedHalfword => arm_load_signed_halfword(cpu, instr),
        ArmInstr::LoadDoubleword => arm_load_doubleword(cpu, instr),
        ArmInstr::StoreDoubleword => arm_store_doubleword(cpu, instr),
        ArmInstr::LoadExByte => arm_load_ex_byte(cpu, instr),
        ArmInstr::StoreExByte => arm_store_ex_byte(cpu, instr),
        ArmInstr::LoadExHalfword => arm_load_ex_halfword(cpu, instr),
        ArmInstr::StoreExHalfword => arm_store_ex_halfword(cpu, instr),
        ArmInstr::LoadExWord => arm_load_ex_word(cpu, instr),
        ArmInstr::StoreExWord => arm_store_ex_word(cpu, instr),
        ArmInstr::LoadExDoubleword => arm_load_ex_doubleword(cpu, instr),
        ArmInstr::StoreExDoubleword => arm_store_ex_doubleword(cpu, instr),
        ArmInstr::LoadBlock => arm_load_block(cpu, instr),
        ArmInstr::StoreBlock => arm_store_block(cpu, instr),
        ArmInstr::CopLoadStore => arm_cop_load_store(cpu, instr),
        ArmInstr::CopRegTransfer => arm_cop_transfer(cpu, instr),
        ArmInstr::CopDataOp => arm_cop_data_op(cpu, instr),
        ArmInstr::Nop | ArmInstr::Yield => Ok(()),
        ArmInstr::Wfe => {
            cpu.wfe();
            Ok(())
        }
        ArmInstr::Wfi => {
            cpu.halt();
            Ok(())
        }
        ArmInstr::Sev => {
            cpu.sev();
            Ok(())
        }
        ArmInstr::Clrex => {
            cpu.clear_exclusive();
            Ok(())
        }
        ArmInstr::Undefined => {
            Err(EmuError::fatal(format!("[{}] undefined ARM instr {:08x}", cpu.id, instr)))
        }
    }
}

fn arm_b(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let mut offset = ((instr & 0xFF_FFFF) << 2) as i32;
    offset <<= 6;
    offset >>= 6;

    let address = cpu.gpr[REG_PC].wrapping_add(offset as u32);

    if instr & (1 << 24) != 0 {
        cpu.gpr[REG_LR] = cpu.gpr[REG_PC].wrapping_sub(4);
    }
    cpu.jump(address, false);
    Ok(())
}

fn arm_bx(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let new_address = cpu.gpr[(instr & 0xF) as usize];
    cpu.jump(new_address, true);
    Ok(())
}

fn arm_blx_imm(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let mut offset = ((instr & 0xFF_FFFF) << 2) as i32;
    offset <<= 6;
    offset >>= 6;
    if instr & (1 << 24) != 0 {
        offset += 2;
    }

    let address = cpu.gpr[REG_PC];
    cpu.gpr[REG_LR] = address.wrapping_sub(4);
    // Target is always Thumb; the low bit makes jump flip the state.
    cpu.jump(address.wrapping_add(offset as u32).wrapping_add(1), true);
    Ok(())
}

fn arm_blx_reg(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    // Fetch the target before clobbering LR, the operand may be LR itself
    let new_address = cpu.gpr[(instr & 0xF) as usize];
    cpu.gpr[REG_LR] = cpu.gpr[REG_PC].wrapping_sub(4);
    cpu.jump(new_address, true);
    Ok(())
}

fn arm_clz(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = cpu.gpr[(instr & 0xF) as usize];
    let destination = ((instr >> 12) & 0xF) as usize;
    cpu.gpr[destination] = source.leading_zeros();
    Ok(())
}

fn arm_sxtb(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let rot = (instr >> 10) & 0x3;
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.rotr32(cpu.gpr[source], rot * 8, false);
    cpu.gpr[dest] = value as u8 as i8 as i32 as u32;
    Ok(())
}

fn arm_sxth(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let rot = (instr >> 10) & 0x3;
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.rotr32(cpu.gpr[source], rot * 8, false);
    cpu.gpr[dest] = value as u16 as i16 as i32 as u32;
    Ok(())
}

fn arm_uxtb(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let rot = (instr >> 10) & 0x3;
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.rotr32(cpu.gpr[source], rot * 8, false);
    cpu.gpr[dest] = value & 0xFF;
    Ok(())
}

fn arm_uxth(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let rot = (instr >> 10) & 0x3;
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.rotr32(cpu.gpr[source], rot * 8, false);
    cpu.gpr[dest] = value & 0xFFFF;
    Ok(())
}

fn arm_rev(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let dest = ((instr >> 12) & 0xF) as usize;
    cpu.gpr[dest] = cpu.gpr[source].swap_bytes();
    Ok(())
}

fn arm_rev16(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let source = (instr & 0xF) as usize;
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.gpr[source];
    cpu.gpr[dest] = ((value & 0x00FF_00FF) << 8) | ((value & 0xFF00_FF00) >> 8);
    Ok(())
}

fn arm_data_processing(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let opcode = (instr >> 21) & 0xF;
    let first_operand = ((instr >> 16) & 0xF) as usize;
    let first_operand_contents = cpu.gpr[first_operand];
    let set_condition_codes = instr & (1 << 20) != 0;

    let destination = ((instr >> 12) & 0xF) as usize;
    let is_operand_imm = instr & (1 << 25) != 0;

    // Only the logical subset lets the shifter update carry.
    let set_carry = match opcode {
        0x0 | 0x1 | 0x8 | 0x9 | 0xC | 0xD | 0xE | 0xF => set_condition_codes,
        _ => false,
    };

    let second_operand;
    if is_operand_imm {
        let imm = instr & 0xFF;
        let shift = (instr & 0xF00) >> 7;
        second_operand = cpu.rotr32(imm, shift, set_carry);
    } else {
        let mut value = cpu.gpr[(instr & 0xF) as usize];
        let shift_type = (instr >> 5) & 0x3;

        let shift;
        if instr & (1 << 4) != 0 {
            shift = cpu.gpr[((instr >> 8) & 0xF) as usize] & 0xFF;
            // PC as the shifted operand reads ahead by one more word
            if instr & 0xF == 15 {
                value = cpu.gpr[REG_PC].wrapping_add(4);
            }
        } else {
            shift = (instr >> 7) & 0x1F;
        }

        second_operand = match shift_type {
            0 => cpu.lsl(value, shift, set_carry),
            1 => {
                if shift != 0 || instr & (1 << 4) != 0 {
                    cpu.lsr(value, shift, set_carry)
                } else {
                    cpu.lsr_32(value, set_carry)
                }
            }
            2 => {
                if shift != 0 || instr & (1 << 4) != 0 {
                    cpu.asr(value, shift, set_carry)
                } else {
                    cpu.asr_32(value, set_carry)
                }
            }
            _ => {
                if shift == 0 && instr & (1 << 4) == 0 {
                    cpu.rrx(value, set_carry)
                } else {
                    cpu.rotr32(value, shift, set_carry)
                }
            }
        };
    }

    match opcode {
        0x0 => cpu.andd(destination, first_operand_contents, second_operand, set_condition_codes),
        0x1 => cpu.eor(destination, first_operand_contents, second_operand, set_condition_codes),
        0x2 => cpu.sub(destination, first_operand_contents, second_operand, set_condition_codes),
        0x3 => cpu.sub(destination, second_operand, first_operand_contents, set_condition_codes),
        0x4 => cpu.add(destination, first_operand_contents, second_operand, set_condition_codes)?,
        0x5 => cpu.adc(destination, first_operand_contents, second_operand, set_condition_codes)?,
        0x6 => cpu.sbc(destination, first_operand_contents, second_operand, set_condition_codes),
        0x7 => cpu.sbc(destination, second_operand, first_operand_contents, set_condition_codes),
        0x8 => {
            if set_condition_codes {
                cpu.tst(first_operand_contents, second_operand);
            } else {
                cpu.mrs(instr);
            }
        }
        0x9 => {
            if set_condition_codes {
                cpu.teq(first_operand_contents, second_operand);
            } else {
                cpu.msr(instr);
            }
        }
        0xA => {
            if set_condition_codes {
                cpu.cmp(first_operand_contents, second_operand);
            } else {
                cpu.mrs(instr);
            }
        }
        0xB => {
            if set_condition_codes {
                cpu.cmn(first_operand_contents, second_operand);
            } else {
                cpu.msr(instr);
            }
        }
        0xC => cpu.orr(destination, first_operand_contents, second_operand, set_condition_codes),
        0xD => cpu.mov(destination, second_operand, set_condition_codes),
        0xE => cpu.bic(destination, first_operand_contents, second_operand, set_condition_codes),
        _ => cpu.mvn(destination, second_operand, set_condition_codes),
    }
    Ok(())
}

fn arm_signed_halfword_multiply(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let destination = ((instr >> 16) & 0xF) as usize;
    let accumulate = ((instr >> 12) & 0xF) as usize;
    let first_operand = ((instr >> 8) & 0xF) as usize;
    let second_operand = (instr & 0xF) as usize;
    let opcode = (instr >> 21) & 0xF;

    let first_op_top = instr & (1 << 6) != 0;
    let second_op_top = instr & (1 << 5) != 0;

    let half = |reg: u32, top: bool| -> i32 {
        if top {
            (reg >> 16) as i16 as i32
        } else {
            reg as i16 as i32
        }
    };

    let result;
    match opcode {
        0x8 => {
            // SMLAxy: the accumulate can overflow into the sticky Q flag
            let product = half(cpu.gpr[first_operand], first_op_top)
                .wrapping_mul(half(cpu.gpr[second_operand], second_op_top))
                as u32;
            let acc = cpu.gpr[accumulate];
            result = product.wrapping_add(acc);
            if add_overflow(product, acc, result) {
                cpu.cpsr.q_overflow = true;
            }
        }
        0x9 => {
            // SMULWy / SMLAWy
            let product = half(cpu.gpr[first_operand], first_op_top) as i64;
            let big_product = (product * (cpu.gpr[second_operand] as i32 as i64)) / 0x10000;
            if instr & (1 << 5) == 0 {
                let acc = cpu.gpr[accumulate];
                result = (big_product as u32).wrapping_add(acc);
                if add_overflow(big_product as u32, acc, result) {
                    cpu.cpsr.q_overflow = true;
                }
            } else {
                result = big_product as u32;
            }
        }
        0xB => {
            result = half(cpu.gpr[first_operand], first_op_top)
                .wrapping_mul(half(cpu.gpr[second_operand], second_op_top))
                as u32;
        }
        _ => {
            return Err(EmuError::fatal(format!("unrecognized smul opcode {:x}", opcode)));
        }
    }

    cpu.gpr[destination] = result;
    Ok(())
}

fn arm_mul(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let accumulate = instr & (1 << 21) != 0;
    let set_condition_codes = instr & (1 << 20) != 0;
    let destination = ((instr >> 16) & 0xF) as usize;
    let first_operand = (instr & 0xF) as usize;
    let second_operand = ((instr >> 8) & 0xF) as usize;
    let third_operand = ((instr >> 12) & 0xF) as usize;

    let mut result = cpu.gpr[first_operand].wrapping_mul(cpu.gpr[second_operand]);
    if accumulate {
        result = result.wrapping_add(cpu.gpr[third_operand]);
    }
    if set_condition_codes {
        cpu.set_zero_neg_flags(result);
    }
    cpu.gpr[destination] = result;
    Ok(())
}

fn arm_mul_long(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_signed = instr & (1 << 22) != 0;
    let accumulate = instr & (1 << 21) != 0;
    let set_condition_codes = instr & (1 << 20) != 0;

    let dest_hi = ((instr >> 16) & 0xF) as usize;
    let dest_lo = ((instr >> 12) & 0xF) as usize;
    let first_operand = cpu.gpr[((instr >> 8) & 0xF) as usize];
    let second_operand = cpu.gpr[(instr & 0xF) as usize];

    let mut result: u64 = if is_signed {
        ((first_operand as i32 as i64).wrapping_mul(second_operand as i32 as i64)) as u64
    } else {
        (first_operand as u64).wrapping_mul(second_operand as u64)
    };

    if accumulate {
        let big_reg = (cpu.gpr[dest_lo] as u64) | ((cpu.gpr[dest_hi] as u64) << 32);
        result = result.wrapping_add(big_reg);
    }

    cpu.gpr[dest_lo] = result as u32;
    cpu.gpr[dest_hi] = (result >> 32) as u32;

    if set_condition_codes {
        cpu.cpsr.zero = result == 0;
        cpu.cpsr.negative = result >> 63 != 0;
    }
    Ok(())
}

fn arm_swp(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_byte = instr & (1 << 22) != 0;
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let source = (instr & 0xF) as usize;

    if is_byte {
        let old = cpu.read8(base)?;
        let value = cpu.gpr[source] as u8;
        cpu.write8(base, value)?;
        cpu.gpr[dest] = old as u32;
    } else {
        let old = cpu.read32(base & !0x3)?;
        let old = cpu.rotr32(old, (base & 0x3) * 8, false);
        let value = cpu.gpr[source];
        cpu.write32(base & !0x3, value)?;
        cpu.gpr[dest] = old;
    }
    Ok(())
}

fn load_store_shift_reg(cpu: &mut ArmCpu, instr: u32) -> u32 {
    let reg = cpu.gpr[(instr & 0xF) as usize];
    let shift_type = (instr >> 5) & 0x3;
    let mut shift = (instr >> 7) & 0x1F;

    match shift_type {
        0 => cpu.lsl(reg, shift, false),
        1 => {
            if shift == 0 {
                shift = 32;
            }
            cpu.lsr(reg, shift, false)
        }
        2 => {
            if shift == 0 {
                shift = 32;
            }
            cpu.asr(reg, shift, false)
        }
        _ => {
            if shift == 0 {
                cpu.rrx(reg, false)
            } else {
                cpu.rotr32(reg, shift, false)
            }
        }
    }
}

// The word/byte forms share one addressing matrix: immediate or scaled
// register offset, pre/post indexing, optional writeback.
fn wb_address(address: u32, offset: u32, adding: bool) -> u32 {
    if adding {
        address.wrapping_add(offset)
    } else {
        address.wrapping_sub(offset)
    }
}

fn arm_load_byte(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = ((instr >> 16) & 0xF) as usize;
    let destination = ((instr >> 12) & 0xF) as usize;
    let is_imm = instr & (1 << 25) == 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;

    let offset = if is_imm { instr & 0xFFF } else { load_store_shift_reg(cpu, instr) };
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        let value = cpu.read8(address)?;
        cpu.gpr[destination] = value as u32;
    } else {
        let value = cpu.read8(address)?;
        cpu.gpr[destination] = value as u32;
        if base != destination {
            cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
        }
    }
    Ok(())
}

fn arm_store_byte(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = ((instr >> 16) & 0xF) as usize;
    let source = ((instr >> 12) & 0xF) as usize;
    let is_imm = instr & (1 << 25) == 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;

    let offset = if is_imm { instr & 0xFFF } else { load_store_shift_reg(cpu, instr) };
    let address = cpu.gpr[base];
    let value = cpu.gpr[source] as u8;

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        cpu.write8(address, value)?;
    } else {
        cpu.write8(address, value)?;
        cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
    }
    Ok(())
}

fn arm_load_word(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = ((instr >> 16) & 0xF) as usize;
    let destination = ((instr >> 12) & 0xF) as usize;
    let is_imm = instr & (1 << 25) == 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;

    let offset = if is_imm { instr & 0xFFF } else { load_store_shift_reg(cpu, instr) };
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        let word = cpu.read32(address & !0x3)?;
        let word = cpu.rotr32(word, (address & 0x3) * 8, false);
        if destination == REG_PC {
            cpu.jump(word, true);
        } else {
            cpu.gpr[destination] = word;
        }
    } else {
        let word = cpu.read32(address & !0x3)?;
        let word = cpu.rotr32(word, (address & 0x3) * 8, false);
        if destination == REG_PC {
            cpu.jump(word, true);
        } else {
            cpu.gpr[destination] = word;
        }
        if base != destination {
            cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
        }
    }
    Ok(())
}

fn arm_store_word(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = ((instr >> 16) & 0xF) as usize;
    let source = ((instr >> 12) & 0xF) as usize;
    let is_imm = instr & (1 << 25) == 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;

    let offset = if is_imm { instr & 0xFFF } else { load_store_shift_reg(cpu, instr) };
    let address = cpu.gpr[base];
    let value = cpu.gpr[source];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        cpu.write32(address & !0x3, value)?;
    } else {
        cpu.write32(address & !0x3, value)?;
        cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
    }
    Ok(())
}

// Halfword/signed/doubleword forms take a split 8-bit immediate or a plain
// register offset.
fn halfword_offset(cpu: &ArmCpu, instr: u32) -> u32 {
    let mut offset = instr & 0xF;
    if instr & (1 << 22) != 0 {
        offset |= (instr >> 4) & 0xF0;
        offset
    } else {
        cpu.gpr[offset as usize]
    }
}

fn arm_load_halfword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let destination = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back && base != destination {
            cpu.gpr[base] = address;
        }
        let value = cpu.read16(address)?;
        cpu.gpr[destination] = value as u32;
    } else {
        let value = cpu.read16(address)?;
        cpu.gpr[destination] = value as u32;
        if base != destination {
            cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
        }
    }
    Ok(())
}

fn arm_store_halfword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let source = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];
    let halfword = cpu.gpr[source] as u16;

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        cpu.write16(address, halfword)?;
        if is_writing_back {
            cpu.gpr[base] = address;
        }
    } else {
        cpu.write16(address, halfword)?;
        cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
    }
    Ok(())
}

fn arm_load_signed_byte(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let destination = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        let value = cpu.read8(address)? as i8 as i32 as u32;
        cpu.gpr[destination] = value;
    } else {
        let value = cpu.read8(address)? as i8 as i32 as u32;
        cpu.gpr[destination] = value;
        if base != destination {
            cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
        }
    }
    Ok(())
}

fn arm_load_signed_halfword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let destination = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        if is_writing_back {
            cpu.gpr[base] = address;
        }
        let value = cpu.read16(address)? as i16 as i32 as u32;
        cpu.gpr[destination] = value;
    } else {
        let value = cpu.read16(address)? as i16 as i32 as u32;
        cpu.gpr[destination] = value;
        if base != destination {
            cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
        }
    }
    Ok(())
}

fn arm_load_doubleword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let dest = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        cpu.gpr[dest] = cpu.read32(address)?;
        cpu.gpr[dest + 1] = cpu.read32(address.wrapping_add(4))?;
        if is_writing_back {
            cpu.gpr[base] = address;
        }
    } else {
        cpu.gpr[dest] = cpu.read32(address)?;
        cpu.gpr[dest + 1] = cpu.read32(address.wrapping_add(4))?;
        cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
    }
    Ok(())
}

fn arm_store_doubleword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let is_preindexing = instr & (1 << 24) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_writing_back = instr & (1 << 21) != 0;
    let base = ((instr >> 16) & 0xF) as usize;
    let source = ((instr >> 12) & 0xF) as usize;

    let offset = halfword_offset(cpu, instr);
    let address = cpu.gpr[base];

    if is_preindexing {
        let address = wb_address(address, offset, is_adding_offset);
        cpu.write32(address, cpu.gpr[source])?;
        cpu.write32(address.wrapping_add(4), cpu.gpr[source + 1])?;
        if is_writing_back {
            cpu.gpr[base] = address;
        }
    } else {
        cpu.write32(address, cpu.gpr[source])?;
        cpu.write32(address.wrapping_add(4), cpu.gpr[source + 1])?;
        cpu.gpr[base] = wb_address(address, offset, is_adding_offset);
    }
    Ok(())
}

// ---- exclusive accesses ----

fn arm_load_ex_byte(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.read8(base)?;
    cpu.set_exclusive(base, 1);
    cpu.gpr[dest] = value as u32;
    Ok(())
}

fn arm_store_ex_byte(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let source = (instr & 0xF) as usize;

    if cpu.has_exclusive(base) {
        let value = cpu.gpr[source] as u8;
        cpu.write8(base, value)?;
        cpu.clear_exclusive();
        cpu.gpr[dest] = 0;
    } else {
        cpu.gpr[dest] = 1;
    }
    Ok(())
}

fn arm_load_ex_halfword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.read16(base)?;
    cpu.set_exclusive(base, 2);
    cpu.gpr[dest] = value as u32;
    Ok(())
}

fn arm_store_ex_halfword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let source = (instr & 0xF) as usize;

    if cpu.has_exclusive(base) {
        let value = cpu.gpr[source] as u16;
        cpu.write16(base, value)?;
        cpu.clear_exclusive();
        cpu.gpr[dest] = 0;
    } else {
        cpu.gpr[dest] = 1;
    }
    Ok(())
}

fn arm_load_ex_word(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let value = cpu.read32(base)?;
    cpu.set_exclusive(base, 4);
    cpu.gpr[dest] = value;
    Ok(())
}

fn arm_store_ex_word(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let source = (instr & 0xF) as usize;

    if cpu.has_exclusive(base) {
        let value = cpu.gpr[source];
        cpu.write32(base, value)?;
        cpu.clear_exclusive();
        cpu.gpr[dest] = 0;
    } else {
        cpu.gpr[dest] = 1;
    }
    Ok(())
}

fn arm_load_ex_doubleword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let lo = cpu.read32(base)?;
    let hi = cpu.read32(base.wrapping_add(4))?;
    cpu.set_exclusive(base, 8);
    cpu.gpr[dest] = lo;
    cpu.gpr[dest + 1] = hi;
    Ok(())
}

fn arm_store_ex_doubleword(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let base = cpu.gpr[((instr >> 16) & 0xF) as usize];
    let dest = ((instr >> 12) & 0xF) as usize;
    let source = (instr & 0xF) as usize;

    if cpu.has_exclusive(base) {
        cpu.write32(base, cpu.gpr[source])?;
        cpu.write32(base.wrapping_add(4), cpu.gpr[source + 1])?;
        cpu.clear_exclusive();
        cpu.gpr[dest] = 0;
    } else {
        cpu.gpr[dest] = 1;
    }
    Ok(())
}

// ---- block transfers ----

fn arm_load_block(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let reg_list = instr & 0xFFFF;
    let base = ((instr >> 16) & 0xF) as usize;
    let is_writing_back = instr & (1 << 21) != 0;
    let load_psr = instr & (1 << 22) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let user_bank_transfer = load_psr && reg_list & (1 << 15) == 0;
    let change_cpsr = load_psr && reg_list & (1 << 15) != 0;

    let mut address = cpu.gpr[base];
    let offset: i32 = if is_adding_offset { 4 } else { -4 };

    let old_mode = cpu.cpsr.mode;
    if user_bank_transfer {
        cpu.update_reg_mode(PsrMode::User);
        cpu.cpsr.mode = PsrMode::User;
    }

    let result = (|| -> Result<(), EmuError> {
        let mut touch = |cpu: &mut ArmCpu, i: usize, address: &mut u32| -> Result<(), EmuError> {
            if is_preindexing {
                *address = (*address as i64 + offset as i64) as u32;
                let word = cpu.read32(*address)?;
                if i == 15 {
                    cpu.jump(word, true);
                } else {
                    cpu.gpr[i] = word;
                }
            } else {
                let word = cpu.read32(*address)?;
                if i == 15 {
                    cpu.jump(word, true);
                } else {
                    cpu.gpr[i] = word;
                }
                *address = (*address as i64 + offset as i64) as u32;
            }
            Ok(())
        };

        // Memory is touched in register order: lowest register at the
        // lowest address.
        if is_adding_offset {
            for i in 0..16 {
                if reg_list & (1 << i) != 0 {
                    touch(cpu, i, &mut address)?;
                }
            }
        } else {
            for i in (0..16).rev() {
                if reg_list & (1 << i) != 0 {
                    touch(cpu, i, &mut address)?;
                }
            }
        }
        Ok(())
    })();

    if user_bank_transfer {
        cpu.update_reg_mode(old_mode);
        cpu.cpsr.mode = old_mode;
    }
    result?;

    if is_writing_back && reg_list & (1 << base) == 0 {
        cpu.gpr[base] = address;
    }

    if change_cpsr {
        cpu.spsr_to_cpsr();
    }
    Ok(())
}

fn arm_store_block(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let reg_list = instr & 0xFFFF;
    let base = ((instr >> 16) & 0xF) as usize;
    let is_writing_back = instr & (1 << 21) != 0;
    let load_psr = instr & (1 << 22) != 0;
    let is_adding_offset = instr & (1 << 23) != 0;
    let is_preindexing = instr & (1 << 24) != 0;
    let user_bank_transfer = load_psr && reg_list & (1 << 15) == 0;

    let mut address = cpu.gpr[base];
    let offset: i32 = if is_adding_offset { 4 } else { -4 };

    let old_mode = cpu.cpsr.mode;
    if user_bank_transfer {
        cpu.update_reg_mode(PsrMode::User);
        cpu.cpsr.mode = PsrMode::User;
    }

    let result = (|| -> Result<(), EmuError> {
        let mut touch = |cpu: &mut ArmCpu, i: usize, address: &mut u32| -> Result<(), EmuError> {
            if is_preindexing {
                *address = (*address as i64 + offset as i64) as u32;
                cpu.write32(*address, cpu.gpr[i])?;
            } else {
                cpu.write32(*address, cpu.gpr[i])?;
                *address = (*address as i64 + offset as i64) as u32;
            }
            Ok(())
        };

        if is_adding_offset {
            for i in 0..16 {
                if reg_list & (1 << i) != 0 {
                    touch(cpu, i, &mut address)?;
                }
            }
        } else {
            for i in (0..16).rev() {
                if reg_list & (1 << i) != 0 {
                    touch(cpu, i, &mut address)?;
                }
            }
        }
        Ok(())
    })();

    if user_bank_transfer {
        cpu.update_reg_mode(old_mode);
        cpu.cpsr.mode = old_mode;
    }
    result?;

    if is_writing_back {
        cpu.gpr[base] = address;
    }
    Ok(())
}

// ---- coprocessor traffic ----

fn arm_cop_load_store(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let cp_num = (instr >> 8) & 0xF;
    if cp_num == 10 || cp_num == 11 {
        return vfp::vfp_load_store(cpu, instr);
    }
    warn!("[{}] load/store to coprocessor {} ignored", cpu.id, cp_num);
    Ok(())
}

fn arm_cop_transfer(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let cp_num = (instr >> 8) & 0xF;
    if cp_num == 10 || cp_num == 11 {
        return vfp::vfp_single_transfer(cpu, instr);
    }

    let opc1 = (instr >> 21) & 0x7;
    let is_loading = instr & (1 << 20) != 0;
    let crn = (instr >> 16) & 0xF;
    let arm_reg = ((instr >> 12) & 0xF) as usize;
    let opc2 = (instr >> 5) & 0x7;
    let crm = instr & 0xF;

    if is_loading {
        let value = cpu.mrc(cp_num, opc1, crn, crm, opc2);
        cpu.gpr[arm_reg] = value;
    } else {
        let value = cpu.gpr[arm_reg];
        cpu.mcr(cp_num, opc1, crn, crm, opc2, value);
    }
    Ok(())
}

fn arm_cop_data_op(cpu: &mut ArmCpu, instr: u32) -> Result<(), EmuError> {
    let cp_num = (instr >> 8) & 0xF;
    if cp_num == 10 || cp_num == 11 {
        return vfp::vfp_data_processing(cpu, instr);
    }
    warn!("[{}] data op on coprocessor {} ignored", cpu.id, cp_num);
    Ok(())
}

// ---- Thumb ----

pub fn execute_thumb(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    match decode_thumb(instr) {
        ThumbInstr::MovShift => thumb_move_shift(cpu, instr),
        ThumbInstr::AddReg => thumb_add_reg(cpu, instr),
        ThumbInstr::SubReg => thumb_sub_reg(cpu, instr),
        ThumbInstr::MovImm => thumb_mov(cpu, instr),
        ThumbInstr::CmpImm => thumb_cmp(cpu, instr),
        ThumbInstr::AddImm => thumb_add(cpu, instr),
        ThumbInstr::SubImm => thumb_sub(cpu, instr),
        ThumbInstr::AluOp => thumb_alu(cpu, instr),
        ThumbInstr::HiRegOp => thumb_hi_reg_op(cpu, instr),
        ThumbInstr::PcRelLoad => thumb_pc_rel_load(cpu, instr),
        ThumbInstr::StoreRegOffset => thumb_store_reg(cpu, instr),
        ThumbInstr::LoadRegOffset => thumb_load_reg(cpu, instr),
        ThumbInstr::LoadStoreSignHalfword => thumb_load_store_signed(cpu, instr),
        ThumbInstr::StoreHalfword => thumb_store_halfword(cpu, instr),
        ThumbInstr::LoadHalfword => thumb_load_halfword(cpu, instr),
        ThumbInstr::StoreImmOffset => thumb_store_imm(cpu, instr),
        ThumbInstr::LoadImmOffset => thumb_load_imm(cpu, instr),
        ThumbInstr::SpRelStore => thumb_sp_rel_store(cpu, instr),
        ThumbInstr::SpRelLoad => thumb_sp_rel_load(cpu, instr),
        ThumbInstr::OffsetSp => thumb_offset_sp(cpu, instr),
        ThumbInstr::Sxth => thumb_sxth(cpu, instr),
        ThumbInstr::Sxtb => thumb_sxtb(cpu, instr),
        ThumbInstr::Uxth => thumb_uxth(cpu, instr),
        ThumbInstr::Uxtb => thumb_uxtb(cpu, instr),
        ThumbInstr::Rev => thumb_rev(cpu, instr),
        ThumbInstr::Rev16 => thumb_rev16(cpu, instr),
        ThumbInstr::LoadAddress => thumb_load_addr(cpu, instr),
        ThumbInstr::Pop => thumb_pop(cpu, instr),
        ThumbInstr::Push => thumb_push(cpu, instr),
        ThumbInstr::StoreMultiple => thumb_store_block(cpu, instr),
        ThumbInstr::LoadMultiple => thumb_load_block(cpu, instr),
        ThumbInstr::Branch => thumb_branch(cpu, instr),
        ThumbInstr::CondBranch => thumb_cond_branch(cpu, instr),
        ThumbInstr::SoftwareInterrupt => {
            cpu.swi();
            Ok(())
        }
        ThumbInstr::Bkpt => Err(EmuError::PrefetchAbort { vaddr: cpu.gpr[REG_PC].wrapping_sub(4) }),
        ThumbInstr::LongBranchPrep => thumb_long_branch_prep(cpu, instr),
        ThumbInstr::LongBranch => thumb_long_branch(cpu, instr),
        ThumbInstr::LongBlx => thumb_long_blx(cpu, instr),
        ThumbInstr::Undefined => {
            Err(EmuError::fatal(format!("[{}] undefined Thumb instr {:04x}", cpu.id, instr)))
        }
    }
}

fn thumb_move_shift(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let opcode = (instr >> 11) & 0x3;
    let mut shift = ((instr >> 6) & 0x1F) as u32;
    let source = ((instr >> 3) & 0x7) as usize;
    let destination = (instr & 0x7) as usize;
    let value = cpu.gpr[source];

    let value = match opcode {
        0 => cpu.lsl(value, shift, true),
        1 => {
            if shift == 0 {
                shift = 32;
            }
            cpu.lsr(value, shift, true)
        }
        _ => {
            if shift == 0 {
                shift = 32;
            }
            cpu.asr(value, shift, true)
        }
    };
    cpu.gpr[destination] = value;
    Ok(())
}

fn thumb_add_reg(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    let operand = ((instr >> 6) & 0x7) as u32;
    let is_imm = instr & (1 << 10) != 0;

    let operand = if is_imm { operand } else { cpu.gpr[operand as usize] };
    cpu.add(destination, cpu.gpr[source], operand, true)
}

fn thumb_sub_reg(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    let operand = ((instr >> 6) & 0x7) as u32;
    let is_imm = instr & (1 << 10) != 0;

    let operand = if is_imm { operand } else { cpu.gpr[operand as usize] };
    cpu.sub(destination, cpu.gpr[source], operand, true);
    Ok(())
}

fn thumb_mov(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (instr & 0xFF) as u32;
    let reg = ((instr >> 8) & 0x7) as usize;
    cpu.mov(reg, offset, true);
    Ok(())
}

fn thumb_cmp(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (instr & 0xFF) as u32;
    let reg = ((instr >> 8) & 0x7) as usize;
    cpu.cmp(cpu.gpr[reg], offset);
    Ok(())
}

fn thumb_add(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (instr & 0xFF) as u32;
    let reg = ((instr >> 8) & 0x7) as usize;
    cpu.add(reg, cpu.gpr[reg], offset, true)
}

fn thumb_sub(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (instr & 0xFF) as u32;
    let reg = ((instr >> 8) & 0x7) as usize;
    cpu.sub(reg, cpu.gpr[reg], offset, true);
    Ok(())
}

fn thumb_alu(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    let opcode = (instr >> 6) & 0xF;

    match opcode {
        0x0 => cpu.andd(destination, cpu.gpr[destination], cpu.gpr[source], true),
        0x1 => cpu.eor(destination, cpu.gpr[destination], cpu.gpr[source], true),
        0x2 => {
            let reg = cpu.lsl(cpu.gpr[destination], cpu.gpr[source] & 0xFF, true);
            cpu.gpr[destination] = reg;
        }
        0x3 => {
            let reg = cpu.lsr(cpu.gpr[destination], cpu.gpr[source] & 0xFF, true);
            cpu.gpr[destination] = reg;
        }
        0x4 => {
            let reg = cpu.asr(cpu.gpr[destination], cpu.gpr[source] & 0xFF, true);
            cpu.gpr[destination] = reg;
        }
        0x5 => cpu.adc(destination, cpu.gpr[destination], cpu.gpr[source], true)?,
        0x6 => cpu.sbc(destination, cpu.gpr[destination], cpu.gpr[source], true),
        0x7 => {
            let reg = cpu.rotr32(cpu.gpr[destination], cpu.gpr[source] & 0xFF, true);
            cpu.gpr[destination] = reg;
        }
        0x8 => cpu.tst(cpu.gpr[destination], cpu.gpr[source]),
        0x9 => cpu.sub(destination, 0, cpu.gpr[source], true), // rsbs rd, rs, #0
        0xA => cpu.cmp(cpu.gpr[destination], cpu.gpr[source]),
        0xB => cpu.cmn(cpu.gpr[destination], cpu.gpr[source]),
        0xC => cpu.orr(destination, cpu.gpr[destination], cpu.gpr[source], true),
        0xD => cpu.mul(destination, cpu.gpr[destination], cpu.gpr[source], true),
        0xE => cpu.bic(destination, cpu.gpr[destination], cpu.gpr[source], true),
        _ => cpu.mvn(destination, cpu.gpr[source], true),
    }
    Ok(())
}

fn thumb_hi_reg_op(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let opcode = (instr >> 8) & 0x3;
    let high_source = instr & (1 << 6) != 0;
    let high_dest = instr & (1 << 7) != 0;

    let source = (((instr >> 3) & 0x7) + (high_source as u16) * 8) as usize;
    let destination = ((instr & 0x7) + (high_dest as u16) * 8) as usize;

    match opcode {
        0x0 => {
            if destination == REG_PC {
                let target = cpu.gpr[REG_PC].wrapping_add(cpu.gpr[source]);
                cpu.jump(target, false);
            } else {
                cpu.add(destination, cpu.gpr[destination], cpu.gpr[source], false)?;
            }
        }
        0x1 => cpu.cmp(cpu.gpr[destination], cpu.gpr[source]),
        0x2 => {
            if destination == REG_PC {
                let target = cpu.gpr[source];
                cpu.jump(target, false);
            } else {
                cpu.mov(destination, cpu.gpr[source], false);
            }
        }
        _ => {
            // BX / BLX
            let target = cpu.gpr[source];
            if high_dest {
                cpu.gpr[REG_LR] = cpu.gpr[REG_PC].wrapping_sub(1);
            }
            cpu.jump(target, true);
        }
    }
    Ok(())
}

fn thumb_load_imm(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = (instr & 0x7) as usize;
    let base = ((instr >> 3) & 0x7) as usize;
    let offset = ((instr >> 6) & 0x1F) as u32;
    let is_byte = instr & (1 << 12) != 0;

    let address = cpu.gpr[base];
    if is_byte {
        let value = cpu.read8(address.wrapping_add(offset))?;
        cpu.gpr[destination] = value as u32;
    } else {
        let address = address.wrapping_add(offset << 2);
        let word = cpu.read32(address & !0x3)?;
        let word = cpu.rotr32(word, (address & 0x3) * 8, false);
        cpu.gpr[destination] = word;
    }
    Ok(())
}

fn thumb_store_imm(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let source = (instr & 0x7) as usize;
    let base = ((instr >> 3) & 0x7) as usize;
    let offset = ((instr >> 6) & 0x1F) as u32;
    let is_byte = instr & (1 << 12) != 0;

    let address = cpu.gpr[base];
    if is_byte {
        cpu.write8(address.wrapping_add(offset), cpu.gpr[source] as u8)?;
    } else {
        cpu.write32(address.wrapping_add(offset << 2), cpu.gpr[source])?;
    }
    Ok(())
}

fn thumb_load_reg(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let is_byte = instr & (1 << 10) != 0;
    let base = ((instr >> 3) & 0x7) as usize;
    let destination = (instr & 0x7) as usize;
    let offset = ((instr >> 6) & 0x7) as usize;

    let address = cpu.gpr[base].wrapping_add(cpu.gpr[offset]);
    if is_byte {
        let value = cpu.read8(address)?;
        cpu.gpr[destination] = value as u32;
    } else {
        let word = cpu.read32(address & !0x3)?;
        let word = cpu.rotr32(word, (address & 0x3) * 8, false);
        cpu.gpr[destination] = word;
    }
    Ok(())
}

fn thumb_store_reg(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let is_byte = instr & (1 << 10) != 0;
    let base = ((instr >> 3) & 0x7) as usize;
    let source = (instr & 0x7) as usize;
    let offset = ((instr >> 6) & 0x7) as usize;

    let address = cpu.gpr[base].wrapping_add(cpu.gpr[offset]);
    let value = cpu.gpr[source];
    if is_byte {
        cpu.write8(address, value as u8)?;
    } else {
        cpu.write32(address, value)?;
    }
    Ok(())
}

fn thumb_load_halfword(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (((instr >> 6) & 0x1F) << 1) as u32;
    let base = ((instr >> 3) & 0x7) as usize;
    let destination = (instr & 0x7) as usize;

    let address = cpu.gpr[base].wrapping_add(offset);
    let value = cpu.read16(address)?;
    cpu.gpr[destination] = value as u32;
    Ok(())
}

fn thumb_store_halfword(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (((instr >> 6) & 0x1F) << 1) as u32;
    let base = ((instr >> 3) & 0x7) as usize;
    let source = (instr & 0x7) as usize;

    let address = cpu.gpr[base].wrapping_add(offset);
    cpu.write16(address, cpu.gpr[source] as u16)?;
    Ok(())
}

fn thumb_load_store_signed(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = (instr & 0x7) as usize;
    let base = ((instr >> 3) & 0x7) as usize;
    let offset = ((instr >> 6) & 0x7) as usize;
    let opcode = (instr >> 10) & 0x3;

    let address = cpu.gpr[base].wrapping_add(cpu.gpr[offset]);

    match opcode {
        0 => cpu.write16(address, cpu.gpr[destination] as u16)?,
        1 => {
            let value = cpu.read8(address)? as i8 as i32 as u32;
            cpu.gpr[destination] = value;
        }
        2 => {
            let value = cpu.read16(address)?;
            cpu.gpr[destination] = value as u32;
        }
        _ => {
            let value = cpu.read16(address)? as i16 as i32 as u32;
            cpu.gpr[destination] = value;
        }
    }
    Ok(())
}

fn thumb_load_block(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let reg_list = instr & 0xFF;
    let base = ((instr >> 8) & 0x7) as usize;

    let mut address = cpu.gpr[base];
    for reg in 0..8 {
        if reg_list & (1 << reg) != 0 {
            let word = cpu.read32(address)?;
            cpu.gpr[reg] = word;
            address = address.wrapping_add(4);
        }
    }

    if reg_list & (1 << base) == 0 {
        cpu.gpr[base] = address;
    }
    Ok(())
}

fn thumb_store_block(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let reg_list = instr & 0xFF;
    let base = ((instr >> 8) & 0x7) as usize;

    let mut address = cpu.gpr[base];
    for reg in 0..8 {
        if reg_list & (1 << reg) != 0 {
            cpu.write32(address, cpu.gpr[reg])?;
            address = address.wrapping_add(4);
        }
    }
    cpu.gpr[base] = address;
    Ok(())
}

fn thumb_push(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let reg_list = instr & 0xFF;
    let mut stack_pointer = cpu.gpr[REG_SP];

    if instr & (1 << 8) != 0 {
        stack_pointer = stack_pointer.wrapping_sub(4);
        cpu.write32(stack_pointer, cpu.gpr[REG_LR])?;
    }
    for i in (0..8).rev() {
        if reg_list & (1 << i) != 0 {
            stack_pointer = stack_pointer.wrapping_sub(4);
            cpu.write32(stack_pointer, cpu.gpr[i])?;
        }
    }
    cpu.gpr[REG_SP] = stack_pointer;
    Ok(())
}

fn thumb_pop(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let reg_list = instr & 0xFF;
    let mut stack_pointer = cpu.gpr[REG_SP];

    for i in 0..8 {
        if reg_list & (1 << i) != 0 {
            let word = cpu.read32(stack_pointer)?;
            cpu.gpr[i] = word;
            stack_pointer = stack_pointer.wrapping_add(4);
        }
    }
    if instr & (1 << 8) != 0 {
        let target = cpu.read32(stack_pointer)?;
        cpu.jump(target, true);
        stack_pointer = stack_pointer.wrapping_add(4);
    }
    cpu.gpr[REG_SP] = stack_pointer;
    Ok(())
}

fn thumb_pc_rel_load(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = ((instr >> 8) & 0x7) as usize;
    let address = cpu.gpr[REG_PC].wrapping_add(((instr & 0xFF) as u32) << 2) & !0x3;
    let word = cpu.read32(address)?;
    cpu.gpr[destination] = word;
    Ok(())
}

fn thumb_load_addr(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = ((instr >> 8) & 0x7) as usize;
    let offset = ((instr & 0xFF) as u32) << 2;
    let adding_sp = instr & (1 << 11) != 0;

    let address = if adding_sp {
        cpu.gpr[REG_SP]
    } else {
        cpu.gpr[REG_PC] & !0x2
    };
    cpu.add(destination, address, offset, false)
}

fn thumb_sp_rel_load(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let destination = ((instr >> 8) & 0x7) as usize;
    let offset = ((instr & 0xFF) as u32) << 2;
    let word = cpu.read32(cpu.gpr[REG_SP].wrapping_add(offset))?;
    cpu.gpr[destination] = word;
    Ok(())
}

fn thumb_sp_rel_store(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let source = ((instr >> 8) & 0x7) as usize;
    let offset = ((instr & 0xFF) as u32) << 2;
    cpu.write32(cpu.gpr[REG_SP].wrapping_add(offset), cpu.gpr[source])?;
    Ok(())
}

fn thumb_offset_sp(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = ((instr & 0x7F) as u32) << 2;
    if instr & (1 << 7) != 0 {
        cpu.gpr[REG_SP] = cpu.gpr[REG_SP].wrapping_sub(offset);
    } else {
        cpu.gpr[REG_SP] = cpu.gpr[REG_SP].wrapping_add(offset);
    }
    Ok(())
}

fn thumb_sxth(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    cpu.gpr[dest] = cpu.gpr[source] as u16 as i16 as i32 as u32;
    Ok(())
}

fn thumb_sxtb(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    cpu.gpr[dest] = cpu.gpr[source] as u8 as i8 as i32 as u32;
    Ok(())
}

fn thumb_uxth(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    cpu.gpr[dest] = cpu.gpr[source] & 0xFFFF;
    Ok(())
}

fn thumb_uxtb(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    cpu.gpr[dest] = cpu.gpr[source] & 0xFF;
    Ok(())
}

fn thumb_rev(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    cpu.gpr[dest] = cpu.gpr[source].swap_bytes();
    Ok(())
}

fn thumb_rev16(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let dest = (instr & 0x7) as usize;
    let source = ((instr >> 3) & 0x7) as usize;
    let value = cpu.gpr[source];
    cpu.gpr[dest] = ((value & 0x00FF_00FF) << 8) | ((value & 0xFF00_FF00) >> 8);
    Ok(())
}

fn thumb_branch(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let mut offset = ((instr & 0x7FF) << 1) as i16;
    offset <<= 4;
    offset >>= 4;

    let address = cpu.gpr[REG_PC].wrapping_add(offset as i32 as u32);
    cpu.jump(address, false);
    Ok(())
}

fn thumb_cond_branch(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let condition = ((instr >> 8) & 0xF) as u32;
    let offset = (((instr as u32) << 24) as i32) >> 23;

    if cpu.meets_condition(condition) {
        let address = cpu.gpr[REG_PC].wrapping_add(offset as u32);
        cpu.jump(address, false);
    }
    Ok(())
}

fn thumb_long_branch_prep(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let offset = (((instr & 0x7FF) as i32) << 21) >> 9;
    cpu.gpr[REG_LR] = cpu.gpr[REG_PC].wrapping_add(offset as u32);
    Ok(())
}

fn thumb_long_branch(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let address = cpu.gpr[REG_LR].wrapping_add(((instr & 0x7FF) as u32) << 1);
    let new_lr = cpu.gpr[REG_PC].wrapping_sub(2) | 0x1; // keep the Thumb bit for return
    cpu.gpr[REG_LR] = new_lr;
    cpu.jump(address, false);
    Ok(())
}

fn thumb_long_blx(cpu: &mut ArmCpu, instr: u16) -> Result<(), EmuError> {
    let address = cpu.gpr[REG_LR].wrapping_add(((instr & 0x7FF) as u32) << 1);
    let new_lr = cpu.gpr[REG_PC].wrapping_sub(2) | 0x1;
    cpu.gpr[REG_LR] = new_lr;
    // Low bits clear, so this lands back in ARM state
    cpu.jump(address, true);
    Ok(())
}
