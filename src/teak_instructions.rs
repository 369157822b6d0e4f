// Execution of the Teak instruction set. Register operand fields go through
// the small mapping tables up top (the encodings do not use one uniform
// register numbering), then each kind's semantics runs against the core in
// teak.rs.

use crate::teak::{sign_extend, sign_extend16, Teak, TeakIo, TeakReg};
use crate::teak_parser::{decode, TeakInstr};
use crate::EmuError;

fn get_register(reg: u8) -> Result<TeakReg, EmuError> {
    match reg {
        0x00 => Ok(TeakReg::R0),
        0x01 => Ok(TeakReg::R1),
        0x02 => Ok(TeakReg::R2),
        0x03 => Ok(TeakReg::R3),
        0x04 => Ok(TeakReg::R4),
        0x05 => Ok(TeakReg::R5),
        0x06 => Ok(TeakReg::R7), // r7, not r6
        0x07 => Ok(TeakReg::Y0),
        0x08 => Ok(TeakReg::St0),
        0x09 => Ok(TeakReg::St1),
        0x0A => Ok(TeakReg::St2),
        0x0B => Ok(TeakReg::P),
        0x0C => Ok(TeakReg::Pc),
        0x0D => Ok(TeakReg::Sp),
        0x0E => Ok(TeakReg::CfgI),
        0x0F => Ok(TeakReg::CfgJ),
        0x10 => Ok(TeakReg::B0h),
        0x11 => Ok(TeakReg::B1h),
        0x12 => Ok(TeakReg::B0l),
        0x13 => Ok(TeakReg::B1l),
        0x18 => Ok(TeakReg::A0),
        0x19 => Ok(TeakReg::A1),
        0x1A => Ok(TeakReg::A0l),
        0x1B => Ok(TeakReg::A1l),
        0x1C => Ok(TeakReg::A0h),
        0x1D => Ok(TeakReg::A1h),
        0x1E => Ok(TeakReg::Lc),
        0x1F => Ok(TeakReg::Sv),
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized register field {:02x}", reg))),
    }
}

fn get_ax_reg(ax: u8) -> TeakReg {
    if ax == 0 {
        TeakReg::A0
    } else {
        TeakReg::A1
    }
}

fn get_axl_reg(axl: u8) -> TeakReg {
    if axl == 0 {
        TeakReg::A0l
    } else {
        TeakReg::A1l
    }
}

fn get_bx_reg(bx: u8) -> TeakReg {
    if bx == 0 {
        TeakReg::B0
    } else {
        TeakReg::B1
    }
}

fn get_ab_reg(ab: u8) -> TeakReg {
    match ab {
        0x0 => TeakReg::B0,
        0x1 => TeakReg::B1,
        0x2 => TeakReg::A0,
        _ => TeakReg::A1,
    }
}

fn get_abe_reg(abe: u8) -> TeakReg {
    match abe {
        0x0 => TeakReg::B0e,
        0x1 => TeakReg::B1e,
        0x2 => TeakReg::A0e,
        _ => TeakReg::A1e,
    }
}

fn get_abl_reg(abl: u8) -> TeakReg {
    match abl {
        0x0 => TeakReg::B0l,
        0x1 => TeakReg::B1l,
        0x2 => TeakReg::A0l,
        _ => TeakReg::A1l,
    }
}

fn get_ablh_reg(ablh: u8) -> TeakReg {
    match ablh {
        0x0 => TeakReg::B0l,
        0x1 => TeakReg::B0h,
        0x2 => TeakReg::B1l,
        0x3 => TeakReg::B1h,
        0x4 => TeakReg::A0l,
        0x5 => TeakReg::A0h,
        0x6 => TeakReg::A1l,
        _ => TeakReg::A1h,
    }
}

fn get_sttmod_reg(sttmod: u8) -> Result<TeakReg, EmuError> {
    match sttmod {
        0x0 => Ok(TeakReg::Stt0),
        0x1 => Ok(TeakReg::Stt1),
        0x2 => Ok(TeakReg::Stt2),
        0x4 => Ok(TeakReg::Mod0),
        0x5 => Ok(TeakReg::Mod1),
        0x6 => Ok(TeakReg::Mod2),
        0x7 => Ok(TeakReg::Mod3),
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized sttmod field {:02x}", sttmod))),
    }
}

fn get_ararp_reg(ararp: u8) -> Result<TeakReg, EmuError> {
    match ararp {
        0x0 => Ok(TeakReg::Ar0),
        0x1 => Ok(TeakReg::Ar1),
        0x2 => Ok(TeakReg::Arp0),
        0x3 => Ok(TeakReg::Arp1),
        0x4 => Ok(TeakReg::Arp2),
        0x5 => Ok(TeakReg::Arp3),
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized ararp field {:02x}", ararp))),
    }
}

fn get_ararpsttmod_reg(field: u8) -> Result<TeakReg, EmuError> {
    if field < 8 {
        get_ararp_reg(field)
    } else {
        get_sttmod_reg(field - 8)
    }
}

fn get_rnold(rnold: u8) -> Result<TeakReg, EmuError> {
    get_register(rnold & 0x7)
}

fn get_counter_acc(acc: TeakReg) -> TeakReg {
    match acc {
        TeakReg::A0 => TeakReg::A1,
        _ => TeakReg::A0,
    }
}

pub fn interpret(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    match decode(instr) {
        TeakInstr::Nop => Ok(()),
        TeakInstr::AlmMemImm8 => alm_memimm8(teak, io, instr),
        TeakInstr::AlmRnStep => alm_rn_step(teak, io, instr),
        TeakInstr::AlmReg => alm_reg(teak, io, instr),
        TeakInstr::AluMemImm16 => alu_memimm16(teak, io, instr),
        TeakInstr::AluImm16 => alu_imm16(teak, io, instr),
        TeakInstr::AluImm8 => alu_imm8(teak, io, instr),
        TeakInstr::AluMemR7Imm7s => alu_memr7imm7s(teak, io, instr),
        TeakInstr::Or1 => or_1(teak, instr),
        TeakInstr::Or2 => or_2(teak, instr),
        TeakInstr::AlbMemImm8 => alb_memimm8(teak, io, instr),
        TeakInstr::AlbRnStep => alb_rn_step(teak, io, instr),
        TeakInstr::AlbReg => alb_reg(teak, io, instr),
        TeakInstr::AddAbBx => add_ab_bx(teak, instr),
        TeakInstr::AddBxAx => add_bx_ax(teak, instr),
        TeakInstr::AddPxBx => add_px_bx(teak, instr),
        TeakInstr::SubAbBx => sub_ab_bx(teak, instr),
        TeakInstr::SubBxAx => sub_bx_ax(teak, instr),
        TeakInstr::SetSttMod => set_sttmod(teak, io, instr),
        TeakInstr::RstSttMod => rst_sttmod(teak, io, instr),
        TeakInstr::Mpyi => mpyi(teak, instr),
        TeakInstr::Moda4 => moda4(teak, instr),
        TeakInstr::Moda3 => moda3(teak, instr),
        TeakInstr::BkrepImm8 => bkrep_imm8(teak, io, instr),
        TeakInstr::BkrepReg => bkrep_reg(teak, io, instr),
        TeakInstr::BkrepRstMemSp => bkreprst_memsp(teak, io),
        TeakInstr::BkrepStoMemSp => bkrepsto_memsp(teak, io),
        TeakInstr::Banke => {
            teak.banke((instr & 0x3F) as u8);
            Ok(())
        }
        TeakInstr::Br => br(teak, io, instr),
        TeakInstr::Brr => brr(teak, instr),
        TeakInstr::Break => teak.break_loop(),
        TeakInstr::Call => call(teak, io, instr),
        TeakInstr::CallaAx => calla_ax(teak, io, instr),
        TeakInstr::Callr => callr(teak, io, instr),
        TeakInstr::CntxS => {
            teak.save_context();
            Ok(())
        }
        TeakInstr::CntxR => {
            teak.restore_context();
            Ok(())
        }
        TeakInstr::Ret => ret(teak, io, instr),
        TeakInstr::Reti => reti(teak, io, instr),
        TeakInstr::Retic => retic(teak, io, instr),
        TeakInstr::Rets => rets(teak, io, instr),
        TeakInstr::PushImm16 => {
            let value = teak.fetch_code_word(io.mem);
            teak.push16(value, io)
        }
        TeakInstr::PushReg => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let value = teak.get_reg16(reg, true)?;
            teak.push16(value, io)
        }
        TeakInstr::PushAbe => {
            let abe = get_abe_reg(((instr >> 1) & 0x3) as u8);
            let value = (teak.get_saturated_acc(abe)? >> 32) as u16;
            teak.push16(value, io)
        }
        TeakInstr::PushArArpSttMod => {
            let reg = get_ararpsttmod_reg((instr & 0xF) as u8)?;
            let value = teak.get_reg16(reg, false)?;
            teak.push16(value, io)
        }
        TeakInstr::PushPx => {
            let value = teak.get_product(((instr >> 1) & 0x1) as usize);
            teak.push16(value as u16, io)?;
            teak.push16((value >> 16) as u16, io)
        }
        TeakInstr::PushR6 => teak.push16(teak.r[6], io),
        TeakInstr::PushRepc => teak.push16(teak.repc, io),
        TeakInstr::PushX0 => teak.push16(teak.x[0], io),
        TeakInstr::PushX1 => teak.push16(teak.x[1], io),
        TeakInstr::PushY1 => teak.push16(teak.y[1], io),
        TeakInstr::PushaAx => {
            let ax = get_ax_reg(((instr >> 6) & 0x1) as u8);
            let value = teak.get_saturated_acc(ax)? as u32;
            teak.push16(value as u16, io)?;
            teak.push16((value >> 16) as u16, io)
        }
        TeakInstr::PushaBx => {
            let bx = get_bx_reg(((instr >> 6) & 0x1) as u8);
            let value = teak.get_saturated_acc(bx)? as u32;
            teak.push16(value as u16, io)?;
            teak.push16((value >> 16) as u16, io)
        }
        TeakInstr::PopReg => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let value = teak.pop16(io)?;
            teak.set_reg16(reg, value)
        }
        TeakInstr::PopAbe => {
            let abe = get_abe_reg((instr & 0x3) as u8);
            let acc = teak.get_acc(abe)?;
            let ext = sign_extend((teak.pop16(io)? & 0xFF) as u64, 8);
            teak.set_acc_and_flag(abe, (acc & 0xFFFF_FFFF) | (ext << 32))
        }
        TeakInstr::PopArArpSttMod => {
            let reg = get_ararpsttmod_reg(((instr >> 8) & 0xF) as u8)?;
            let value = teak.pop16(io)?;
            teak.set_reg16(reg, value)
        }
        TeakInstr::PopPx => {
            let hi = teak.pop16(io)?;
            let lo = teak.pop16(io)?;
            teak.set_product((instr & 0x1) as usize, lo as u32 | ((hi as u32) << 16));
            Ok(())
        }
        TeakInstr::PopR6 => {
            let value = teak.pop16(io)?;
            teak.set_reg16(TeakReg::R6, value)
        }
        TeakInstr::PopRepc => {
            let value = teak.pop16(io)?;
            teak.repc = value;
            Ok(())
        }
        TeakInstr::PopX0 => {
            let value = teak.pop16(io)?;
            teak.x[0] = value;
            Ok(())
        }
        TeakInstr::PopX1 => {
            let value = teak.pop16(io)?;
            teak.x[1] = value;
            Ok(())
        }
        TeakInstr::PopY1 => {
            let value = teak.pop16(io)?;
            teak.y[1] = value;
            Ok(())
        }
        TeakInstr::Popa => {
            let ab = get_ab_reg((instr & 0x3) as u8);
            let h = teak.pop16(io)?;
            let l = teak.pop16(io)?;
            let value = sign_extend(l as u64 | ((h as u64) << 16), 32);
            teak.set_acc_and_flag(ab, value)
        }
        TeakInstr::RepImm => {
            teak.repeat(instr & 0xFF);
            Ok(())
        }
        TeakInstr::RepReg => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let lc = teak.get_reg16(reg, false)?;
            teak.repeat(lc);
            Ok(())
        }
        TeakInstr::Shfc => shfc(teak, instr),
        TeakInstr::Shfi => shfi(teak, instr),
        TeakInstr::TstbRnStep => tstb_rn_step(teak, io, instr),
        TeakInstr::TstbReg => tstb_reg(teak, instr),
        TeakInstr::And => and_acc(teak, instr),
        TeakInstr::Dint => {
            teak.mod3.master_int_enable = false;
            Ok(())
        }
        TeakInstr::Eint => {
            teak.mod3.master_int_enable = true;
            Ok(())
        }
        TeakInstr::ExpReg => exp_reg(teak, instr),
        TeakInstr::Modr => modr(teak, instr),
        TeakInstr::ModrI2 => modr_i2(teak, instr),
        TeakInstr::ModrD2 => modr_d2(teak, instr),
        TeakInstr::MovAblhMemImm8 => mov_ablh_memimm8(teak, io, instr),
        TeakInstr::MovAxlMemImm16 => mov_axl_memimm16(teak, io, instr),
        TeakInstr::MovAxlMemR7Imm7s => mov_axl_memr7imm7s(teak, io, instr),
        TeakInstr::MovMemImm8Ab => mov_memimm8_ab(teak, io, instr),
        TeakInstr::MovMemImm8Ablh => mov_memimm8_ablh(teak, io, instr),
        TeakInstr::MovMemImm8RnOld => mov_memimm8_rnold(teak, io, instr),
        TeakInstr::MovMemImm16Ax => mov_memimm16_ax(teak, io, instr),
        TeakInstr::MovImm16Bx => mov_imm16_bx(teak, io, instr),
        TeakInstr::MovImm16Reg => mov_imm16_reg(teak, io, instr),
        TeakInstr::MovImm8sRnOld => mov_imm8s_rnold(teak, instr),
        TeakInstr::MovSvMemImm8 => {
            let value = teak.read_from_page((instr & 0xFF) as u8, io)?;
            teak.sv = value;
            Ok(())
        }
        TeakInstr::MovSvImm8s => {
            teak.sv = sign_extend16(instr & 0xFF, 8);
            Ok(())
        }
        TeakInstr::MovImm8Axl => {
            let axl = get_axl_reg(((instr >> 12) & 0x1) as u8);
            teak.set_reg16(axl, instr & 0xFF)
        }
        TeakInstr::MovRnStepBx => mov_rn_step_bx(teak, io, instr),
        TeakInstr::MovRnStepReg => mov_rn_step_reg(teak, io, instr),
        TeakInstr::MovMemR7Imm7sAx => mov_memr7imm7s_ax(teak, io, instr),
        TeakInstr::MovRegBx => mov_reg_bx(teak, instr),
        TeakInstr::MovMixpReg => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let mixp = teak.mixp;
            teak.set_reg16(reg, mixp)
        }
        TeakInstr::MovRnOldMemImm8 => mov_rnold_memimm8(teak, io, instr),
        TeakInstr::MovRegMixp => {
            let reg = get_register((instr & 0x1F) as u8)?;
            teak.mixp = teak.get_reg16(reg, true)?;
            Ok(())
        }
        TeakInstr::MovRegReg => mov_reg_reg(teak, instr),
        TeakInstr::MovRegRnStep => mov_reg_rn_step(teak, io, instr),
        TeakInstr::MovSvTo => {
            let sv = teak.sv;
            teak.write_to_page((instr & 0xFF) as u8, sv, io)
        }
        TeakInstr::LoadPage => {
            teak.st1.page = (instr & 0xFF) as u8;
            Ok(())
        }
        TeakInstr::LoadPs01 => {
            teak.st1.ps = (instr & 0x3) as u8;
            teak.mod0.ps1 = ((instr >> 2) & 0x3) as u8;
            Ok(())
        }
        TeakInstr::MovSttMod => {
            let word = teak.fetch_code_word(io.mem);
            let reg = get_sttmod_reg((instr & 0x7) as u8)?;
            teak.set_reg16(reg, word)
        }
        TeakInstr::MovpReg => movp_reg(teak, io, instr),
        TeakInstr::MovAblSttMod => {
            let sttmod = get_sttmod_reg((instr & 0x7) as u8)?;
            let abl = get_abl_reg(((instr >> 3) & 0x3) as u8);
            let value = teak.get_reg16(abl, true)?;
            teak.set_reg16(sttmod, value)
        }
        TeakInstr::MovSttModAbl => {
            let sttmod = get_sttmod_reg((instr & 0x7) as u8)?;
            let abl = get_abl_reg(((instr >> 10) & 0x3) as u8);
            let value = teak.get_reg16(sttmod, false)?;
            teak.set_reg16(abl, value)
        }
        TeakInstr::MovArArp => {
            let word = teak.fetch_code_word(io.mem);
            let reg = get_ararp_reg((instr & 0x7) as u8)?;
            teak.set_reg16(reg, word)
        }
        TeakInstr::MovStepi => {
            teak.stepi = instr & 0x7F;
            Ok(())
        }
        TeakInstr::MovStepj => {
            teak.stepj = instr & 0x7F;
            Ok(())
        }
        TeakInstr::MovR6 => {
            let word = teak.fetch_code_word(io.mem);
            teak.set_reg16(TeakReg::R6, word)
        }
        TeakInstr::MovStepi0 => {
            let word = teak.fetch_code_word(io.mem);
            teak.stepi0 = word;
            Ok(())
        }
        TeakInstr::MovStepj0 => {
            let word = teak.fetch_code_word(io.mem);
            teak.stepj0 = word;
            Ok(())
        }
        TeakInstr::MovA0hStepi0 => {
            teak.stepi0 = teak.get_reg16(TeakReg::A0h, true)?;
            Ok(())
        }
        TeakInstr::MovA0hStepj0 => {
            teak.stepj0 = teak.get_reg16(TeakReg::A0h, true)?;
            Ok(())
        }
        TeakInstr::MovStepi0A0h => {
            let value = teak.stepi0;
            teak.set_reg16(TeakReg::A0h, value)
        }
        TeakInstr::MovStepj0A0h => {
            let value = teak.stepj0;
            teak.set_reg16(TeakReg::A0h, value)
        }
        TeakInstr::MovAblArArp => {
            let ararp = get_ararp_reg((instr & 0x7) as u8)?;
            let abl = get_abl_reg(((instr >> 3) & 0x3) as u8);
            let value = teak.get_reg16(abl, true)?;
            teak.set_reg16(ararp, value)
        }
        TeakInstr::MovArArpAbl => {
            let ararp = get_ararp_reg((instr & 0x7) as u8)?;
            let abl = get_abl_reg(((instr >> 3) & 0x3) as u8);
            let value = teak.get_reg16(ararp, false)?;
            teak.set_reg16(abl, value)
        }
        TeakInstr::MovAxPc => {
            let ax = get_ax_reg(((instr >> 8) & 0x1) as u8);
            let value = teak.get_acc(ax)?;
            teak.pc = (value as u32) & 0x3FFFF;
            Ok(())
        }
        TeakInstr::Mov2PxArStep => mov2_px_arstep(teak, io, instr),
        TeakInstr::Mov2ArStepPx => mov2_arstep_px(teak, io, instr),
        TeakInstr::MovaAbArStep => mova_ab_arstep(teak, io, instr),
        TeakInstr::MovaArStepAb => mova_arstep_ab(teak, io, instr),
        TeakInstr::MovR6Reg => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let value = teak.get_reg16(TeakReg::R6, false)?;
            teak.set_reg16(reg, value)
        }
        TeakInstr::MovRegR6 => {
            let reg = get_register((instr & 0x1F) as u8)?;
            let value = teak.get_reg16(reg, true)?;
            teak.set_reg16(TeakReg::R6, value)
        }
        TeakInstr::MovsMemImm8Ab => movs_memimm8_ab(teak, io, instr),
        TeakInstr::MovsRnStepAb => movs_rn_step_ab(teak, io, instr),
        TeakInstr::MovsRegAb => movs_reg_ab(teak, instr),
        TeakInstr::Movsi => movsi(teak, instr),
        TeakInstr::MaxGt => max_gt(teak, instr),
        TeakInstr::MinLt => min_lt(teak, instr),
        TeakInstr::Undefined => {
            Err(EmuError::fatal(format!("[Teak] unrecognized instr {:04x}", instr)))
        }
    }
}

// ---- accumulator/ALU families ----

fn do_alm_op(teak: &mut Teak, acc: TeakReg, value: u64, op: u8) -> Result<(), EmuError> {
    let acc_value = teak.get_acc(acc)?;
    match op {
        0x0 => {
            // or
            teak.set_acc_and_flag(acc, sign_extend(acc_value | value, 40))?;
        }
        0x1 => {
            teak.set_acc_and_flag(acc, sign_extend(acc_value & value, 40))?;
        }
        0x2 => {
            teak.set_acc_and_flag(acc, sign_extend(acc_value ^ value, 40))?;
        }
        0x3 => {
            let value = sign_extend(value, 16);
            let result = teak.get_add_sub_result(acc_value, value, false);
            teak.saturate_acc_with_flag(acc, result)?;
        }
        0x4 => {
            // tst0
            teak.stt0.fz = (acc_value & 0xFFFF) & value == 0;
        }
        0x5 => {
            // tst1
            teak.stt0.fz = (!acc_value & 0xFFFF) & value == 0;
        }
        0x6 => {
            // cmp
            let value = sign_extend(value, 16);
            let result = teak.get_add_sub_result(acc_value, value, true);
            teak.set_acc_flags(result);
        }
        0x7 => {
            let value = sign_extend(value, 16);
            let result = teak.get_add_sub_result(acc_value, value, true);
            teak.saturate_acc_with_flag(acc, result)?;
        }
        0x9 => {
            // addh
            let value = sign_extend(value << 16, 32);
            let result = teak.get_add_sub_result(acc_value, value, false);
            teak.saturate_acc_with_flag(acc, result)?;
        }
        0xB => {
            // subh
            let value = sign_extend(value << 16, 32);
            let result = teak.get_add_sub_result(acc_value, value, true);
            teak.saturate_acc_with_flag(acc, result)?;
        }
        0xF => {
            // cmpu
            let result = teak.get_add_sub_result(acc_value, value, true);
            teak.set_acc_flags(result);
        }
        _ => return Err(EmuError::fatal(format!("[Teak] unrecognized alm op {:x}", op))),
    }
    Ok(())
}

fn alm_memimm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = (instr & 0xFF) as u8;
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0xF) as u8;
    let value = teak.read_from_page(imm, io)?;
    do_alm_op(teak, acc, value as u64, op)
}

fn alm_rn_step(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0xF) as u8;

    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let value = teak.read_data_word(addr, io)?;
    do_alm_op(teak, acc, value as u64, op)
}

fn alm_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let _ = io;
    let reg = get_register((instr & 0x1F) as u8)?;
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0xF) as u8;

    let value = match reg {
        TeakReg::P => teak.get_product(0),
        TeakReg::A0 | TeakReg::A1 => teak.get_acc(reg)?,
        _ => teak.get_reg16(reg, false)? as u64,
    };
    do_alm_op(teak, acc, value, op)
}

fn alu_memimm16(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let addr = teak.fetch_code_word(io.mem);
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = (instr & 0x7) as u8;
    let value = teak.read_data_word(addr, io)?;
    do_alm_op(teak, acc, value as u64, op)
}

fn alu_imm16(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = teak.fetch_code_word(io.mem);
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0x7) as u8;
    do_alm_op(teak, acc, imm as u64, op)
}

fn alu_imm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let _ = io;
    let imm = instr & 0xFF;
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0x7) as u8;
    if op == 1 {
        return Err(EmuError::fatal("[Teak] 8-bit AND immediate special case".to_string()));
    }
    do_alm_op(teak, acc, imm as u64, op)
}

fn alu_memr7imm7s(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = sign_extend16(instr & 0x7F, 7) as i16;
    let acc = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let op = ((instr >> 9) & 0x7) as u8;
    let value = teak.read_data_r7s(imm, io)?;
    do_alm_op(teak, acc, value as u64, op)
}

fn or_1(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let a = get_ab_reg(((instr >> 10) & 0x3) as u8);
    let b = get_ax_reg(((instr >> 6) & 0x1) as u8);
    let c = get_ax_reg(((instr >> 5) & 0x1) as u8);

    let value = teak.get_acc(a)? | teak.get_acc(b)?;
    teak.set_acc_and_flag(c, value)
}

fn or_2(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let a = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let b = get_bx_reg(((instr >> 1) & 0x1) as u8);
    let c = get_ax_reg((instr & 0x1) as u8);

    let value = teak.get_acc(a)? | teak.get_acc(b)?;
    teak.set_acc_and_flag(c, value)
}

fn is_alb_modifying(op: u8) -> Result<bool, EmuError> {
    match op {
        0x0 | 0x1 | 0x2 | 0x3 | 0x7 => Ok(true),
        0x4 | 0x5 | 0x6 => Ok(false),
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized alb op {:x}", op))),
    }
}

fn do_alb_op(teak: &mut Teak, a: u16, b: u16, op: u8) -> Result<u16, EmuError> {
    let result = match op {
        0x0 => {
            // set
            let r = a | b;
            teak.stt0.fm = r >> 15 != 0;
            r
        }
        0x1 => {
            // rst
            let r = !a & b;
            teak.stt0.fm = r >> 15 != 0;
            r
        }
        0x2 => {
            // chng
            let r = a ^ b;
            teak.stt0.fm = r >> 15 != 0;
            r
        }
        0x3 => {
            // addv
            let temp = a as u32 + b as u32;
            teak.stt0.fc = temp >> 16 != 0;
            teak.stt0.fm = (sign_extend(b as u64, 16) as u32)
                .wrapping_add(sign_extend(a as u64, 16) as u32)
                >> 31
                != 0;
            temp as u16
        }
        0x6 => {
            // cmpv
            let temp = (b as u32).wrapping_sub(a as u32);
            teak.stt0.fc = temp >> 16 != 0;
            teak.stt0.fm = (sign_extend(b as u64, 16) as u32)
                .wrapping_sub(sign_extend(a as u64, 16) as u32)
                >> 31
                != 0;
            temp as u16
        }
        0x7 => {
            // subv
            let temp = (b as u32).wrapping_sub(a as u32);
            teak.stt0.fc = temp >> 16 != 0;
            teak.stt0.fm = (sign_extend(b as u64, 16) as u32)
                .wrapping_sub(sign_extend(a as u64, 16) as u32)
                >> 31
                != 0;
            temp as u16
        }
        _ => return Err(EmuError::fatal(format!("[Teak] unrecognized alb op {:x}", op))),
    };
    teak.stt0.fz = result == 0;
    Ok(result)
}

fn alb_memimm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = teak.fetch_code_word(io.mem);
    let addr = (instr & 0xFF) as u8;
    let op = ((instr >> 9) & 0x7) as u8;

    let current = teak.read_from_page(addr, io)?;
    let result = do_alb_op(teak, imm, current, op)?;
    if is_alb_modifying(op)? {
        teak.write_to_page(addr, result, io)?;
    }
    Ok(())
}

fn alb_rn_step(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = teak.fetch_code_word(io.mem);
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let op = ((instr >> 9) & 0x7) as u8;

    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let current = teak.read_data_word(addr, io)?;
    let result = do_alb_op(teak, imm, current, op)?;
    if is_alb_modifying(op)? {
        teak.write_data_word(addr, result, io)?;
    }
    Ok(())
}

fn alb_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm = teak.fetch_code_word(io.mem);
    let reg = get_register((instr & 0x1F) as u8)?;
    let op = ((instr >> 9) & 0x7) as u8;

    if reg == TeakReg::P {
        return Err(EmuError::fatal("[Teak] P operand in bitfield op".to_string()));
    }
    let reg_value = teak.get_reg16(reg, false)?;
    let result = do_alb_op(teak, imm, reg_value, op)?;

    if is_alb_modifying(op)? {
        match reg {
            TeakReg::A0l | TeakReg::A1l | TeakReg::B0l | TeakReg::B1l => {
                teak.set_acc_lo(reg, result)?;
            }
            TeakReg::A0h | TeakReg::A1h | TeakReg::B0h | TeakReg::B1h => {
                teak.set_acc_hi(reg, result)?;
            }
            _ => teak.set_reg16(reg, result)?,
        }
    }
    Ok(())
}

fn add_ab_bx(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ab = get_ab_reg(((instr >> 10) & 0x3) as u8);
    let bx = get_bx_reg((instr & 0x1) as u8);

    let a = teak.get_acc(ab)?;
    let b = teak.get_acc(bx)?;
    let result = teak.get_add_sub_result(a, b, false);
    teak.saturate_acc_with_flag(bx, result)
}

fn add_bx_ax(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ax = get_ax_reg((instr & 0x1) as u8);
    let bx = get_bx_reg(((instr >> 1) & 0x1) as u8);

    let a = teak.get_acc(bx)?;
    let b = teak.get_acc(ax)?;
    let result = teak.get_add_sub_result(a, b, false);
    teak.saturate_acc_with_flag(ax, result)
}

fn add_px_bx(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let bx = get_bx_reg((instr & 0x1) as u8);
    let a = teak.get_product(((instr >> 1) & 0x1) as usize);
    let b = teak.get_acc(bx)?;
    let result = teak.get_add_sub_result(a, b, false);
    teak.saturate_acc_with_flag(bx, result)
}

fn sub_ab_bx(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ab = get_ab_reg(((instr >> 3) & 0x3) as u8);
    let bx = get_bx_reg(((instr >> 8) & 0x1) as u8);

    let a = teak.get_acc(ab)?;
    let b = teak.get_acc(bx)?;
    let result = teak.get_add_sub_result(b, a, true);
    teak.saturate_acc_with_flag(bx, result)
}

fn sub_bx_ax(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let bx = get_bx_reg(((instr >> 4) & 0x1) as u8);
    let ax = get_ax_reg(((instr >> 3) & 0x1) as u8);

    let a = teak.get_acc(bx)?;
    let b = teak.get_acc(ax)?;
    let result = teak.get_add_sub_result(b, a, true);
    teak.saturate_acc_with_flag(ax, result)
}

fn set_sttmod(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let reg = get_sttmod_reg((instr & 0x7) as u8)?;
    let imm = teak.fetch_code_word(io.mem);
    let current = teak.get_reg16(reg, false)?;
    let result = do_alb_op(teak, imm, current, 0)?;
    teak.set_reg16(reg, result)
}

fn rst_sttmod(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let reg = get_sttmod_reg((instr & 0x7) as u8)?;
    let imm = teak.fetch_code_word(io.mem);
    let current = teak.get_reg16(reg, false)?;
    let result = do_alb_op(teak, imm, current, 1)?;
    teak.set_reg16(reg, result)
}

fn mpyi(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let imm = sign_extend16(instr & 0xFF, 8);
    teak.x[0] = imm;
    teak.multiply(0, true, true);
    Ok(())
}

fn moda4(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let acc = get_ax_reg(((instr >> 12) & 0x1) as u8);
    let op = ((instr >> 4) & 0xF) as u8;
    let cond = (instr & 0xF) as u8;

    if !teak.meets_condition(cond)? {
        return Ok(());
    }
    match op {
        0x6 => teak.saturate_acc_with_flag(acc, 0),
        0x8 => {
            // not
            let value = !teak.get_acc(acc)?;
            teak.set_acc_and_flag(acc, value)
        }
        0x9 => {
            // neg
            let value = teak.get_acc(acc)?;
            teak.stt0.fc = value != 0;
            if value == 0xFFFF_FF80_0000_0000 {
                teak.stt0.fv = true;
                teak.stt0.fvl = true;
            }
            let result = sign_extend((!value).wrapping_add(1), 40);
            teak.saturate_acc_with_flag(acc, result)
        }
        0xC => teak.saturate_acc_with_flag(acc, 0x8000), // clrr
        0xD => {
            let value = teak.get_acc(acc)?;
            let result = teak.get_add_sub_result(value, 1, false);
            teak.saturate_acc_with_flag(acc, result)
        }
        0xE => {
            let value = teak.get_acc(acc)?;
            let result = teak.get_add_sub_result(value, 1, true);
            teak.saturate_acc_with_flag(acc, result)
        }
        0xF => {
            // copy from the other accumulator
            let other = get_counter_acc(acc);
            let value = teak.get_acc(other)?;
            teak.saturate_acc_with_flag(acc, value)
        }
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized moda op {:x}", op))),
    }
}

fn moda3(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let acc = get_bx_reg(((instr >> 12) & 0x1) as u8);
    let op = ((instr >> 4) & 0x7) as u8;
    let cond = (instr & 0xF) as u8;

    if !teak.meets_condition(cond)? {
        return Ok(());
    }
    match op {
        0x6 => teak.saturate_acc_with_flag(acc, 0),
        _ => Err(EmuError::fatal(format!("[Teak] unrecognized modb op {:x}", op))),
    }
}

// ---- repeats and flow control ----

fn bkrep_imm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let lc = instr & 0xFF;
    let mut addr = teak.fetch_code_word(io.mem) as u32;
    addr |= teak.pc & 0x30000;
    teak.block_repeat(lc, addr)
}

fn bkrep_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let mut addr = teak.fetch_code_word(io.mem) as u32;
    addr |= (((instr >> 5) & 0x3) as u32) << 16;
    let reg = get_register((instr & 0x1F) as u8)?;
    let lc = teak.get_reg16(reg, false)?;
    teak.block_repeat(lc, addr)
}

fn bkreprst_memsp(teak: &mut Teak, io: &mut TeakIo) -> Result<(), EmuError> {
    let sp = teak.sp;
    let new_sp = teak.restore_block_repeat(sp, io)?;
    teak.sp = new_sp;
    Ok(())
}

fn bkrepsto_memsp(teak: &mut Teak, io: &mut TeakIo) -> Result<(), EmuError> {
    let sp = teak.sp;
    let new_sp = teak.store_block_repeat(sp, io)?;
    teak.sp = new_sp;
    Ok(())
}

fn br(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let mut addr = teak.fetch_code_word(io.mem) as u32;
    addr |= (((instr >> 4) & 0x3) as u32) << 16;
    let cond = (instr & 0xF) as u8;

    if teak.meets_condition(cond)? {
        teak.pc = addr & 0x3FFFF;
    }
    Ok(())
}

fn brr(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let offset = sign_extend16((instr >> 4) & 0x7F, 7) as i16;
    let cond = (instr & 0xF) as u8;

    if teak.meets_condition(cond)? {
        teak.pc = teak.pc.wrapping_add(offset as u32) & 0x3FFFF;
        // brr $ is the canonical idle loop; sleep instead of spinning
        if offset == -1 {
            teak.halt();
        }
    }
    Ok(())
}

fn call(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let mut addr = teak.fetch_code_word(io.mem) as u32;
    addr |= (((instr >> 4) & 0x3) as u32) << 16;
    let cond = (instr & 0xF) as u8;

    if teak.meets_condition(cond)? {
        teak.push_pc(io)?;
        teak.pc = addr & 0x3FFFF;
    }
    Ok(())
}

fn calla_ax(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let ax = get_ax_reg(((instr >> 4) & 0x1) as u8);
    teak.push_pc(io)?;
    teak.pc = (teak.get_acc(ax)? as u32) & 0x3FFFF;
    Ok(())
}

fn callr(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let offset = sign_extend16((instr >> 4) & 0x7F, 7) as i16;
    let cond = (instr & 0xF) as u8;

    if teak.meets_condition(cond)? {
        teak.push_pc(io)?;
        teak.pc = teak.pc.wrapping_add(offset as u32) & 0x3FFFF;
    }
    Ok(())
}

fn ret(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    if teak.meets_condition((instr & 0xF) as u8)? {
        teak.pop_pc(io)?;
    }
    Ok(())
}

fn reti(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    if teak.meets_condition((instr & 0xF) as u8)? {
        teak.pop_pc(io)?;
        teak.mod3.master_int_enable = true;
    }
    Ok(())
}

fn retic(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    if teak.meets_condition((instr & 0xF) as u8)? {
        teak.pop_pc(io)?;
        teak.mod3.master_int_enable = true;
        teak.restore_context();
    }
    Ok(())
}

fn rets(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    teak.pop_pc(io)?;
    teak.sp = teak.sp.wrapping_add(instr & 0xFF);
    Ok(())
}

// ---- shifts, tests, address-register updates ----

fn shfc(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let a = get_ab_reg(((instr >> 10) & 0x3) as u8);
    let b = get_ab_reg(((instr >> 5) & 0x3) as u8);
    let cond = (instr & 0xF) as u8;

    if teak.meets_condition(cond)? {
        let value = teak.get_acc(a)?;
        let shift = teak.sv;
        teak.shift_reg_40(value, b, shift)?;
    }
    Ok(())
}

fn shfi(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let a = get_ab_reg(((instr >> 10) & 0x3) as u8);
    let b = get_ab_reg(((instr >> 7) & 0x3) as u8);
    let shift = sign_extend16(instr & 0x3F, 6);

    let value = teak.get_acc(a)?;
    teak.shift_reg_40(value, b, shift)
}

fn tstb_rn_step(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let bit = (instr >> 8) & 0xF;

    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let value = teak.read_data_word(addr, io)?;
    teak.stt0.fz = (value >> bit) & 0x1 != 0;
    Ok(())
}

fn tstb_reg(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let reg = get_register((instr & 0x1F) as u8)?;
    let bit = (instr >> 8) & 0xF;
    let value = teak.get_reg16(reg, true)?;
    teak.stt0.fz = (value >> bit) & 0x1 != 0;
    Ok(())
}

fn and_acc(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let a = get_ab_reg(((instr >> 2) & 0x3) as u8);
    let b = get_ab_reg((instr & 0x3) as u8);
    let c = get_ax_reg(((instr >> 12) & 0x1) as u8);

    let value = teak.get_acc(a)? & teak.get_acc(b)?;
    teak.set_acc_and_flag(c, value)
}

fn exp_reg(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let reg = get_register((instr & 0x1F) as u8)?;
    let value = match reg {
        TeakReg::A0 | TeakReg::A1 | TeakReg::B0 | TeakReg::B1 => teak.get_acc(reg)?,
        _ => sign_extend((teak.get_reg16(reg, false)? as u64) << 16, 32),
    };
    teak.sv = Teak::exp(value);
    Ok(())
}

fn modr(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    teak.rn_and_modify(rn, step, false)?;
    teak.check_fr(rn);
    Ok(())
}

fn modr_i2(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    teak.rn_and_modify(rn, 4, false)?;
    teak.check_fr(rn);
    Ok(())
}

fn modr_d2(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    teak.rn_and_modify(rn, 5, false)?;
    teak.check_fr(rn);
    Ok(())
}

// ---- moves ----

fn mov_ablh_memimm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let imm8 = (instr & 0xFF) as u8;
    let ablh = get_ablh_reg(((instr >> 9) & 0x7) as u8);
    let value = teak.get_reg16(ablh, true)?;
    teak.write_to_page(imm8, value, io)
}

fn mov_axl_memimm16(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let addr = teak.fetch_code_word(io.mem);
    let axl = get_axl_reg(((instr >> 8) & 0x1) as u8);
    let value = teak.get_reg16(axl, true)?;
    teak.write_data_word(addr, value, io)
}

fn mov_axl_memr7imm7s(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let axl = get_axl_reg(((instr >> 8) & 0x1) as u8);
    let imm = sign_extend16(instr & 0x7F, 7) as i16;
    let value = teak.get_reg16(axl, true)?;
    teak.write_data_r7s(imm, value, io)
}

fn mov_memimm8_ab(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let ab = get_ab_reg(((instr >> 11) & 0x3) as u8);
    let value = teak.read_from_page((instr & 0xFF) as u8, io)?;
    teak.set_reg16(ab, value)
}

fn mov_memimm8_ablh(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let ablh = get_ablh_reg(((instr >> 10) & 0x7) as u8);
    let value = teak.read_from_page((instr & 0xFF) as u8, io)?;
    teak.set_reg16(ablh, value)
}

fn mov_memimm8_rnold(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rnold = get_rnold(((instr >> 10) & 0x7) as u8)?;
    let value = teak.read_from_page((instr & 0xFF) as u8, io)?;
    teak.set_reg16(rnold, value)
}

fn mov_memimm16_ax(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let addr = teak.fetch_code_word(io.mem);
    let ax = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let value = teak.read_data_word(addr, io)?;
    teak.set_reg16(ax, value)
}

fn mov_imm16_bx(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let word = teak.fetch_code_word(io.mem);
    let bx = get_bx_reg(((instr >> 8) & 0x1) as u8);
    teak.set_reg16(bx, word)
}

fn mov_imm16_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let word = teak.fetch_code_word(io.mem);
    let reg = get_register((instr & 0x1F) as u8)?;
    teak.set_reg16(reg, word)
}

fn mov_imm8s_rnold(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let imm = sign_extend16(instr & 0xFF, 8);
    let rnold = get_rnold(((instr >> 10) & 0x7) as u8)?;
    teak.set_reg16(rnold, imm)
}

fn mov_rn_step_bx(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let bx = get_bx_reg(((instr >> 8) & 0x1) as u8);
    let value = teak.read_data_word(addr, io)?;
    teak.set_reg16(bx, value)
}

fn mov_rn_step_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let reg = get_register(((instr >> 5) & 0x1F) as u8)?;
    let value = teak.read_data_word(addr, io)?;
    teak.set_reg16(reg, value)
}

fn mov_memr7imm7s_ax(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let ax = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let imm = sign_extend16(instr & 0x7F, 7) as i16;
    let value = teak.read_data_r7s(imm, io)?;
    teak.set_reg16(ax, value)
}

fn mov_reg_bx(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let reg = get_register((instr & 0x1F) as u8)?;
    let bx = get_bx_reg(((instr >> 5) & 0x1) as u8);
    if reg == TeakReg::P {
        return Err(EmuError::fatal("[Teak] P operand in mov to bx".to_string()));
    }
    let value = teak.get_reg16(reg, true)?;
    teak.set_reg16(bx, value)
}

fn mov_rnold_memimm8(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rnold = get_rnold(((instr >> 9) & 0x7) as u8)?;
    let value = teak.get_reg16(rnold, false)?;
    teak.write_to_page((instr & 0xFF) as u8, value, io)
}

fn mov_reg_reg(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let reg_a = (instr & 0x1F) as u8;
    let reg_b = ((instr >> 5) & 0x1F) as u8;

    let a = get_register(reg_a)?;
    let b = get_register(reg_b)?;

    if a == TeakReg::P {
        // moving the shifted product targets a full accumulator
        let b = if reg_b & 0x1 != 0 { TeakReg::A1 } else { TeakReg::A0 };
        let value = teak.get_product(0);
        teak.saturate_acc_with_flag(b, value)
    } else if a == TeakReg::Pc {
        if b == TeakReg::A0 || b == TeakReg::A1 {
            let pc = teak.pc;
            teak.saturate_acc_with_flag(b, pc as u64)
        } else {
            let pc = teak.pc;
            teak.set_reg16(b, pc as u16)
        }
    } else {
        let value = teak.get_reg16(a, true)?;
        teak.set_reg16(b, value)
    }
}

fn mov_reg_rn_step(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let reg = get_register(((instr >> 5) & 0x1F) as u8)?;
    let value = teak.get_reg16(reg, true)?;
    teak.write_data_word(addr, value, io)
}

fn movp_reg(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let reg = get_register((instr & 0x1F) as u8)?;
    let ax = get_ax_reg(((instr >> 5) & 0x1) as u8);
    let addr = (teak.get_acc(ax)? as u32) & 0x3FFFF;
    let value = teak.read_program_word(io.mem, addr);
    teak.set_reg16(reg, value)
}

fn mov2_px_arstep(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let value = teak.get_product_no_shift(((instr >> 1) & 0x1) as usize);
    let l = value as u16;
    let h = (value >> 16) as u16;

    let arrn = teak.get_arrn_unit(((instr >> 8) & 0x3) as u8) as usize;
    let arstep = teak.get_arstep(((instr >> 2) & 0x3) as u8);
    let aroffset = teak.get_aroffset(((instr >> 2) & 0x3) as u8);

    let address = teak.rn_addr_and_modify(arrn, arstep, false)?;
    let address2 = teak.offset_addr(arrn, address, aroffset, false)?;

    teak.write_data_word(address2, l, io)?;
    teak.write_data_word(address, h, io)
}

fn mov2_arstep_px(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let arrn = teak.get_arrn_unit(((instr >> 10) & 0x3) as u8) as usize;
    let arstep = teak.get_arstep(((instr >> 5) & 0x3) as u8);
    let aroffset = teak.get_aroffset(((instr >> 5) & 0x3) as u8);

    let address = teak.rn_addr_and_modify(arrn, arstep, false)?;
    let address2 = teak.offset_addr(arrn, address, aroffset, false)?;

    let l = teak.read_data_word(address2, io)?;
    let h = teak.read_data_word(address, io)?;
    teak.set_product((instr & 0x1) as usize, l as u32 | ((h as u32) << 16));
    Ok(())
}

fn mova_ab_arstep(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let acc = get_ab_reg(((instr >> 4) & 0x3) as u8);
    let value = teak.get_saturated_acc(acc)?;
    let l = value as u16;
    let h = (value >> 16) as u16;

    let arrn = teak.get_arrn_unit(((instr >> 2) & 0x3) as u8) as usize;
    let arstep = teak.get_arstep((instr & 0x3) as u8);
    let aroffset = teak.get_aroffset((instr & 0x3) as u8);

    let address = teak.rn_addr_and_modify(arrn, arstep, false)?;
    let address2 = teak.offset_addr(arrn, address, aroffset, false)?;

    teak.write_data_word(address2, l, io)?;
    teak.write_data_word(address, h, io)
}

fn mova_arstep_ab(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let acc = get_ab_reg(((instr >> 4) & 0x3) as u8);

    let arrn = teak.get_arrn_unit(((instr >> 2) & 0x3) as u8) as usize;
    let arstep = teak.get_arstep((instr & 0x3) as u8);
    let aroffset = teak.get_aroffset((instr & 0x3) as u8);

    let address = teak.rn_addr_and_modify(arrn, arstep, false)?;
    let address2 = teak.offset_addr(arrn, address, aroffset, false)?;

    let l = teak.read_data_word(address2, io)?;
    let h = teak.read_data_word(address, io)?;
    teak.saturate_acc_with_flag(acc, l as u64 | ((h as u64) << 16))
}

fn movs_memimm8_ab(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let ab = get_ab_reg(((instr >> 11) & 0x3) as u8);
    let value = sign_extend(teak.read_from_page((instr & 0xFF) as u8, io)? as u64, 16);
    let shift = teak.sv;
    teak.shift_reg_40(value, ab, shift)
}

fn movs_rn_step_ab(teak: &mut Teak, io: &mut TeakIo, instr: u16) -> Result<(), EmuError> {
    let rn = (instr & 0x7) as usize;
    let step = ((instr >> 3) & 0x3) as u8;
    let ab = get_ab_reg(((instr >> 5) & 0x3) as u8);

    let addr = teak.rn_addr_and_modify(rn, step, false)?;
    let value = sign_extend(teak.read_data_word(addr, io)? as u64, 16);
    let shift = teak.sv;
    teak.shift_reg_40(value, ab, shift)
}

fn movs_reg_ab(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ab = get_ab_reg(((instr >> 5) & 0x3) as u8);
    let reg = get_register((instr & 0x1F) as u8)?;
    let value = sign_extend(teak.get_reg16(reg, false)? as u64, 16);
    let shift = teak.sv;
    teak.shift_reg_40(value, ab, shift)
}

fn movsi(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let rnold = get_rnold(((instr >> 9) & 0x7) as u8)?;
    let ab = get_ab_reg(((instr >> 5) & 0x3) as u8);
    let value = sign_extend(teak.get_reg16(rnold, false)? as u64, 16);
    let shift = sign_extend16(instr & 0x1F, 5);
    teak.shift_reg_40(value, ab, shift)
}

// Conditional accumulator select, latching r0 into MIXP on a hit.
fn max_gt(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ax = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let counter = get_counter_acc(ax);

    let u = teak.get_acc(ax)?;
    let v = teak.get_acc(counter)?;
    let d = v.wrapping_sub(u);

    let r0 = teak.rn_and_modify(0, ((instr >> 3) & 0x3) as u8, false)?;

    if (d >> 63) & 0x1 == 0 && d != 0 {
        teak.mixp = r0;
        teak.set_acc(ax, v)?;
        teak.stt0.fm = true;
    } else {
        teak.stt0.fm = false;
    }
    Ok(())
}

fn min_lt(teak: &mut Teak, instr: u16) -> Result<(), EmuError> {
    let ax = get_ax_reg(((instr >> 8) & 0x1) as u8);
    let counter = get_counter_acc(ax);

    let u = teak.get_acc(ax)?;
    let v = teak.get_acc(counter)?;
    let d = u.wrapping_sub(v);

    let r0 = teak.rn_and_modify(0, ((instr >> 3) & 0x3) as u8, false)?;

    if (d >> 63) & 0x1 == 0 && d != 0 {
        teak.mixp = r0;
        teak.set_acc(ax, v)?;
        teak.stt0.fm = true;
    } else {
        teak.stt0.fm = false;
    }
    Ok(())
}
