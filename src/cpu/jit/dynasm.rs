//! Dynasm-rs native JIT backend for x86_64
//!
//! Covers register-only blocks (mov/add between GPRs, ending in a direct
//! jump or a fall-through). Anything touching guest memory is left to the
//! bytecode buffer. Only available on native builds with `jit-dynasm`.

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
mod backend {
    use dynasm::dynasm;
    use dynasmrt::{x64::Assembler, DynasmApi, ExecutableBuffer};
    use std::mem;

    use crate::cpu::jit::buffer::{BlockContext, BlockExit, CodeBuffer, CodeHandle};
    use crate::cpu::jit::{BlockOp, CodegenError, TracedOp};
    use crate::cpu::regs::ARITH_FLAGS;

    const FLAGS_MASK: i32 = ARITH_FLAGS as i32;
    /// Host flags outside the arithmetic set are kept from the guest value
    const FLAGS_KEEP: i32 = !FLAGS_MASK;

    /// Signature: fn(gpr: *mut u32, eflags: *mut u32) -> next eip
    type BlockFn = unsafe extern "sysv64" fn(*mut u32, *mut u32) -> u32;

    struct NativeBlock {
        /// Keeps the mapping alive for `func`
        #[allow(dead_code)]
        code: ExecutableBuffer,
        func: BlockFn,
    }

    pub struct NativeBuffer {
        blocks: Vec<NativeBlock>,
        used: usize,
        capacity: usize,
    }

    impl NativeBuffer {
        pub fn new(capacity: usize) -> Self {
            NativeBuffer {
                blocks: Vec::new(),
                used: 0,
                capacity,
            }
        }
    }

    pub fn can_compile(ops: &[TracedOp]) -> bool {
        !ops.is_empty()
            && ops.iter().all(|t| {
                matches!(
                    t.op,
                    BlockOp::MovRegReg { .. } | BlockOp::AddRegReg { .. } | BlockOp::Jmp { .. }
                )
            })
    }

    impl CodeBuffer for NativeBuffer {
        fn name(&self) -> &'static str {
            "dynasm"
        }

        fn capacity(&self) -> usize {
            self.capacity
        }

        fn used(&self) -> usize {
            self.used
        }

        fn emit(&mut self, ops: &[TracedOp], exit: u32) -> Result<CodeHandle, CodegenError> {
            if !can_compile(ops) {
                return Err(CodegenError::Unsupported(ops.first().map_or(exit, |t| t.pc)));
            }
            let mut asm = Assembler::new().map_err(|e| CodegenError::Backend(e.to_string()))?;

            // RDI = guest GPR array, RSI = guest EFLAGS
            let mut next = exit;
            for traced in ops {
                match traced.op {
                    BlockOp::MovRegReg { dst, src } => {
                        let (d, s) = (dst as i32 * 4, src as i32 * 4);
                        dynasm!(asm
                            ; mov eax, [rdi + s]
                            ; mov [rdi + d], eax
                        );
                    }
                    BlockOp::AddRegReg { dst, src } => {
                        let (d, s) = (dst as i32 * 4, src as i32 * 4);
                        dynasm!(asm
                            ; mov eax, [rdi + s]
                            ; add [rdi + d], eax
                            ; pushfq
                            ; pop rcx
                            ; and ecx, FLAGS_MASK
                            ; mov edx, [rsi]
                            ; and edx, FLAGS_KEEP
                            ; or edx, ecx
                            ; mov [rsi], edx
                        );
                    }
                    BlockOp::Jmp { target } => {
                        next = target;
                        break;
                    }
                    _ => unreachable!("filtered by can_compile"),
                }
            }
            dynasm!(asm
                ; mov eax, next as i32
                ; ret
            );

            let code = asm.finalize().map_err(|_| CodegenError::Backend("finalize failed".into()))?;
            let len = code.len();
            if self.used + len > self.capacity {
                return Err(CodegenError::CacheFull);
            }
            let func: BlockFn = unsafe { mem::transmute(code.ptr(dynasmrt::AssemblyOffset(0))) };
            self.blocks.push(NativeBlock { code, func });
            self.used += len;
            Ok(CodeHandle {
                offset: self.blocks.len() - 1,
                len,
            })
        }

        fn invoke(&self, handle: CodeHandle, ctx: &mut BlockContext<'_>) -> BlockExit {
            let block = &self.blocks[handle.offset];
            let next = unsafe { (block.func)(ctx.regs.gpr.as_mut_ptr(), &mut ctx.regs.eflags) };
            BlockExit::Continue(next)
        }

        fn clear(&mut self) {
            self.blocks.clear();
            self.used = 0;
        }
    }

}

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
pub use backend::*;

/// Stub for builds without the native backend
#[cfg(not(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64")))]
pub fn can_compile(_ops: &[super::TracedOp]) -> bool {
    false
}
