// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-place patching of a dex method body. An injection sequence is spliced
//! at an instruction index; every relative branch, switch payload entry,
//! try range and handler address spanning the splice point is adjusted so
//! the surrounding structure stays valid. Modified methods lose their debug
//! info; a zero offset is valid and verifiers accept it.

use std::{collections::HashMap, convert::TryFrom};

use tracedex_models::models::{
    CodeItem, FormatError, Instruction, InstructionOffset, InstructionSize,
};

/// Splice `instructions` in front of the instruction at `index` (`index ==
/// insns.len()` appends). `outs` raises `outs_size` when the payload makes a
/// wider call than the method did before. The frame is not grown here; the
/// caller resizes it once per method and relocates the arguments.
pub fn insert_instructions(
    code: &mut CodeItem,
    index: usize,
    instructions: Vec<Instruction>,
    outs: u16,
) -> Result<(), FormatError> {
    if index > code.insns.len() {
        return Err(FormatError::corrupt(format!(
            "insertion index {} past the end of the method",
            index
        )));
    }
    let insert_offset = if index == code.insns.len() {
        code.insns_unit_size()
    } else {
        (code.insns[index].1).0
    };

    let mut inserted: Vec<Instruction> = instructions;
    let mut inserted_len: u32 = inserted.iter().map(|i| i.size().0).sum();
    // keep 4-byte payload alignment downstream of the splice intact
    if inserted_len % 2 != 0 {
        inserted.push(Instruction::Nop);
        inserted_len += 1;
    }
    if inserted_len == 0 {
        return Ok(());
    }

    // a branch spans the splice when exactly one side of it shifts
    let crosses = |src: u32, target: i64| -> i64 {
        let target_shifts = target >= insert_offset as i64;
        let src_shifts = src >= insert_offset;
        match (src_shifts, target_shifts) {
            (false, true) => inserted_len as i64,
            (true, false) => -(inserted_len as i64),
            _ => 0,
        }
    };

    // payload offset -> address of the switch instruction owning it
    let mut switch_sources: HashMap<u32, u32> = HashMap::new();
    for (_, offset, insn) in &code.insns {
        if let Instruction::PackedSwitch(_, rel) | Instruction::SparseSwitch(_, rel) = insn {
            let payload = offset.0 as i64 + *rel as i64;
            if payload >= 0 {
                switch_sources.insert(payload as u32, offset.0);
            }
        }
    }

    for (_, offset, insn) in &mut code.insns {
        match insn {
            Instruction::SwitchData(payload) => {
                let switch_addr = match switch_sources.get(&offset.0) {
                    Some(&addr) => addr,
                    None => continue,
                };
                for (_, target) in &mut payload.targets {
                    let absolute = switch_addr as i64 + *target as i64;
                    let shift = crosses(switch_addr, absolute);
                    if shift != 0 {
                        *target = i32::try_from(*target as i64 + shift).map_err(|_| {
                            FormatError::corrupt("switch target exceeds 32 bits")
                        })?;
                    }
                }
            }
            _ => {
                if let Some(rel) = insn.branch_offset() {
                    let absolute = offset.0 as i64 + rel as i64;
                    let shift = crosses(offset.0, absolute);
                    if shift != 0 {
                        *insn = insn.with_branch_offset(
                            i32::try_from(rel as i64 + shift).map_err(|_| {
                                FormatError::corrupt("branch offset exceeds 32 bits")
                            })?,
                        )?;
                    }
                }
            }
        }
    }

    for try_item in &mut code.tries {
        let end = try_item.start_addr + try_item.insn_count as u32;
        if try_item.start_addr >= insert_offset {
            try_item.start_addr += inserted_len;
        } else if end > insert_offset {
            try_item.insn_count = u16::try_from(try_item.insn_count as u32 + inserted_len)
                .map_err(|_| FormatError::corrupt("try range exceeds 16 bits"))?;
        }
    }
    for handler in &mut code.handlers {
        for (_, addr) in &mut handler.catches {
            if *addr >= insert_offset {
                *addr += inserted_len;
            }
        }
        if let Some(addr) = &mut handler.catch_all_addr {
            if *addr >= insert_offset {
                *addr += inserted_len;
            }
        }
    }

    let mut insns = Vec::with_capacity(code.insns.len() + inserted.len());
    for (i, (_, _, insn)) in code.insns.drain(..).enumerate() {
        if i == index {
            for new_insn in inserted.drain(..) {
                insns.push(new_insn);
            }
        }
        insns.push(insn);
    }
    for new_insn in inserted {
        insns.push(new_insn);
    }

    let mut offset = 0u32;
    code.insns = insns
        .into_iter()
        .map(|insn| {
            let size = insn.size();
            let entry = (size, InstructionOffset(offset), insn);
            offset += entry.0 .0;
            entry
        })
        .collect();

    code.outs_size = code.outs_size.max(outs);
    code.debug_info_off = 0;
    Ok(())
}

/// Convert a code address to the index of the instruction covering it, the
/// way offset-targeted injections locate their insertion point. Monotonic in
/// the offset and idempotent.
pub fn index_for_offset(code: &CodeItem, offset: u32) -> usize {
    code.insns
        .iter()
        .position(|(_, insn_offset, _)| insn_offset.0 >= offset)
        .unwrap_or(code.insns.len())
}
