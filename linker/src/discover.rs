// discover.rs — Variable discovery
//
// Scans every kernel, in link order, for operands that name a variable and
// registers one use per occurrence. Which queue holds those operands depends
// on the target: the memory queue's loads/stores when HBM is present, the
// control queue's scratchpad loads/stores otherwise. `link_kernel` later
// consumes exactly the same occurrences, so the use counts balance.

use tracing::{debug, info};

use crate::error::Result;
use crate::isa::{CInstr, MInstr, MemRef};
use crate::loader::KernelDescriptor;
use crate::memory::MemoryModel;

/// Variable names referenced by a memory queue, in order.
pub fn memory_queue_variables(minstrs: &[MInstr]) -> impl Iterator<Item = &str> {
    minstrs
        .iter()
        .filter_map(|m| m.op.mem_ref().and_then(MemRef::var_name))
}

/// Variable names referenced by a control queue's scratchpad operands, in
/// order.
pub fn control_queue_variables(cinstrs: &[CInstr]) -> impl Iterator<Item = &str> {
    cinstrs
        .iter()
        .filter_map(|c| c.op.spad_ref().and_then(MemRef::var_name))
}

/// Register every variable occurrence in `kernels`, then check that the
/// memory map declares nothing the program never touches.
pub fn discover_variables(model: &mut MemoryModel, kernels: &[KernelDescriptor]) -> Result<()> {
    let has_hbm = model.spec().has_hbm;
    for kernel in kernels {
        let mut occurrences = 0usize;
        if has_hbm {
            for name in memory_queue_variables(&kernel.minstrs) {
                model.register(name)?;
                occurrences += 1;
            }
        } else {
            for name in control_queue_variables(&kernel.cinstrs) {
                model.register(name)?;
                occurrences += 1;
            }
        }
        debug!(kernel = %kernel.name, occurrences, "scanned variables");
    }
    model.check_declared_variables_used()?;
    info!(variables = model.len(), "variable discovery complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareSpec;
    use crate::error::codes;
    use crate::mem_map::MemoryMap;
    use crate::memory::UseCount;

    fn kernel(minst: &str, cinst: &str) -> KernelDescriptor {
        KernelDescriptor::from_text("k", minst, cinst, "").unwrap()
    }

    #[test]
    fn hbm_mode_scans_memory_queue() {
        let k = kernel(
            "0, mload, 0, a\n1, mstore, b, 1\n2, mload, 2, a\n3, msyncc, 4\n",
            "0, cload, r0, spad_only\n1, cexit\n",
        );
        let mut m = MemoryModel::new(HardwareSpec::with_hbm(8), MemoryMap::new()).unwrap();
        discover_variables(&mut m, &[k]).unwrap();
        assert_eq!(m.variable("a").unwrap().uses, UseCount::Finite(2));
        assert_eq!(m.variable("b").unwrap().uses, UseCount::Finite(1));
        assert!(m.variable("spad_only").is_none());
    }

    #[test]
    fn spad_mode_scans_control_queue() {
        let k = kernel(
            "0, mload, 0, hbm_only\n1, msyncc, 0\n",
            "0, bload, 0, meta, 1\n1, bones, ones, 0\n2, cload, r0, a\n3, nload, 0, tbl\n4, cstore, a\n5, cexit\n",
        );
        let mut m = MemoryModel::new(HardwareSpec::without_hbm(8), MemoryMap::new()).unwrap();
        discover_variables(&mut m, &[k]).unwrap();
        assert_eq!(m.len(), 4);
        assert_eq!(m.variable("a").unwrap().uses, UseCount::Finite(2));
        assert!(m.variable("hbm_only").is_none());
    }

    #[test]
    fn numeric_operands_are_not_variables() {
        let k = kernel("0, mload, 0, 17\n1, msyncc, 0\n", "0, cexit\n");
        assert_eq!(memory_queue_variables(&k.minstrs).count(), 0);
    }

    #[test]
    fn unreferenced_declaration_fails() {
        let map = MemoryMap::parse("dload, poly, 0, ct_in\n", "m").unwrap();
        let mut m = MemoryModel::new(HardwareSpec::with_hbm(4), map).unwrap();
        let k = kernel("0, mload, 0, other\n1, msyncc, 0\n", "0, cexit\n");
        let err = discover_variables(&mut m, &[k]).unwrap_err();
        assert_eq!(err.code(), codes::L0102);
    }
}
