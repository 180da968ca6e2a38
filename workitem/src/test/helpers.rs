//! Test utilities: canonical kernel builders and a work-group runner.
//!
//! Kernels are built the way the earlier pipeline stages would deliver
//! them: local-id loads in the entry block where a value is shared across
//! regions, every barrier alone in its block, and each function exit a
//! barrier block.

use veld_ir::interp::{ExecEnv, execute};
use veld_ir::{Builder, Function, Module, Type, ValueId};

use crate::kernel_info::KernelInfo;

/// Module with the given static local sizes and a registered kernel name.
pub fn test_module(local_sizes: [u64; 3]) -> Module {
    let mut m = Module::new("test");
    m.set_int_metadata("WGLocalSizeX", local_sizes[0]);
    m.set_int_metadata("WGLocalSizeY", local_sizes[1]);
    m.set_int_metadata("WGLocalSizeZ", local_sizes[2]);
    m.set_bool_metadata("WGDynamicLocalSize", false);
    m
}

/// Register `func` as a kernel of `module` and return its index.
pub fn add_kernel(module: &mut Module, func: Function) -> usize {
    module.add_kernel(&func.name);
    module.add_function(func)
}

/// Run the (transformed) kernel once with zeroed buffers of the given
/// sizes; returns the buffer contents afterwards.
pub fn run_kernel(module: &Module, name: &str, buffer_sizes: &[usize]) -> Vec<Vec<i64>> {
    run_kernel_with_buffers(module, name, buffer_sizes.iter().map(|&n| vec![0; n]).collect())
}

pub fn run_kernel_with_buffers(module: &Module, name: &str, buffers: Vec<Vec<i64>>) -> Vec<Vec<i64>> {
    let index = module.function_index(name).expect("kernel exists");
    let func = module.function(index);
    let mut env = ExecEnv::new();
    env.buffers = buffers;
    // Dynamic kernels read the size globals; harmless for static ones.
    let info_sizes = [
        module.int_metadata("WGLocalSizeX").unwrap_or(1),
        module.int_metadata("WGLocalSizeY").unwrap_or(1),
        module.int_metadata("WGLocalSizeZ").unwrap_or(1),
    ];
    for (d, name) in crate::kernel_info::LOCAL_SIZE_GLOBAL_NAMES.iter().enumerate() {
        if let Some(g) = module.global_by_name(name) {
            env.globals.insert(g, info_sizes[d] as i64);
        }
    }
    execute(func, &mut env).unwrap_or_else(|e| panic!("interpreting {name} failed: {e}\n{func}"));
    env.buffers
}

/// `out[lid_x] = lid_x`, no barriers. Exercises the loops-only route.
pub fn kernel_s1(info: &KernelInfo) -> Function {
    let mut f = Function::new("s1");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let lid = f.global_value(info.local_id_globals[0], "_local_id_x");
    let mut bld = Builder::at_end(&mut f, entry);
    let gid = bld.load(Type::Int64, lid, "gid");
    let gep = bld.gep(Type::Int64, out, gid, "out.gep");
    bld.store(gid, gep);
    bld.ret();
    f
}

/// `a = lid_x; barrier; out[lid_x] = a + 1`. One intermediate barrier; the
/// local-id load lives in the kernel body, so `a` crosses the barrier
/// through a backing slot.
pub fn kernel_s2(info: &KernelInfo) -> Function {
    let mut f = Function::new("s2");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let body = f.create_block("body");
    let bar = f.create_block("bar");
    let post = f.create_block("post");
    let retb = f.create_block("retb");
    let lid = f.global_value(info.local_id_globals[0], "_local_id_x");
    let one = f.const_int(1);

    Builder::at_end(&mut f, entry).br(body);
    let a;
    {
        let mut bld = Builder::at_end(&mut f, body);
        a = bld.load(Type::Int64, lid, "a");
        bld.br(bar);
    }
    {
        let mut bld = Builder::at_end(&mut f, bar);
        bld.call_barrier();
        bld.br(post);
    }
    {
        let mut bld = Builder::at_end(&mut f, post);
        let a1 = bld.add(a, one, "a1");
        let gep = bld.gep(Type::Int64, out, a, "out.gep");
        bld.store(a1, gep);
        bld.br(retb);
    }
    {
        let mut bld = Builder::at_end(&mut f, retb);
        bld.call_barrier();
        bld.ret();
    }
    f
}

/// `x = 0; for i in 0..3 { x += lid_x; barrier; }; out[lid_x] = x`.
/// A loop split by a barrier: exercises the single-region SSA repair.
pub fn kernel_s3(info: &KernelInfo) -> Function {
    let mut f = Function::new("s3");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let header = f.create_block("header");
    let body = f.create_block("body");
    let bar = f.create_block("bar");
    let latch = f.create_block("latch");
    let fin = f.create_block("fin");
    let retb = f.create_block("retb");
    let lid = f.global_value(info.local_id_globals[0], "_local_id_x");
    let zero = f.const_int(0);
    let one = f.const_int(1);
    let three = f.const_int(3);

    let gid;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        gid = bld.load(Type::Int64, lid, "gid");
        bld.br(header);
    }
    let (i_phi, x_phi);
    {
        let mut bld = Builder::at_end(&mut f, header);
        i_phi = bld.phi(Type::Int64, "i");
        x_phi = bld.phi(Type::Int64, "x");
        let cond = bld.icmp(veld_ir::IcmpPred::Slt, i_phi, three, "loop.cond");
        bld.cond_br(cond, body, fin);
    }
    let x2;
    {
        let mut bld = Builder::at_end(&mut f, body);
        x2 = bld.add(x_phi, gid, "x2");
        bld.br(bar);
    }
    {
        let mut bld = Builder::at_end(&mut f, bar);
        bld.call_barrier();
        bld.br(latch);
    }
    let i2;
    {
        let mut bld = Builder::at_end(&mut f, latch);
        i2 = bld.add(i_phi, one, "i2");
        bld.br(header);
    }
    {
        let mut bld = Builder::at_end(&mut f, fin);
        let gep = bld.gep(Type::Int64, out, gid, "out.gep");
        bld.store(x_phi, gep);
        bld.br(retb);
    }
    {
        let mut bld = Builder::at_end(&mut f, retb);
        bld.call_barrier();
        bld.ret();
    }
    f.add_phi_incoming(i_phi, zero, entry);
    f.add_phi_incoming(i_phi, i2, latch);
    f.add_phi_incoming(x_phi, zero, entry);
    f.add_phi_incoming(x_phi, x2, latch);
    f
}

/// 2-D, no barriers: `out[lid_y*size_x + lid_x] = if lid_x < lid_y { 1 }
/// else { 2 }`.
pub fn kernel_s4(info: &KernelInfo) -> Function {
    let mut f = Function::new("s4");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let t = f.create_block("then");
    let e = f.create_block("else");
    let fin = f.create_block("fin");
    let lidx = f.global_value(info.local_id_globals[0], "_local_id_x");
    let lidy = f.global_value(info.local_id_globals[1], "_local_id_y");
    let size_x = f.const_int(info.local_sizes[0] as i64);
    let one = f.const_int(1);
    let two = f.const_int(2);

    let gep;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        let lx = bld.load(Type::Int64, lidx, "lx");
        let ly = bld.load(Type::Int64, lidy, "ly");
        let row = bld.mul(ly, size_x, "row");
        let flat = bld.add(row, lx, "flat");
        gep = bld.gep(Type::Int64, out, flat, "out.gep");
        let cond = bld.icmp(veld_ir::IcmpPred::Slt, lx, ly, "cond");
        bld.cond_br(cond, t, e);
    }
    {
        let mut bld = Builder::at_end(&mut f, t);
        bld.store(one, gep);
        bld.br(fin);
    }
    {
        let mut bld = Builder::at_end(&mut f, e);
        bld.store(two, gep);
        bld.br(fin);
    }
    Builder::at_end(&mut f, fin).ret();
    f
}

/// 3-D with a group-uniform value crossing a barrier:
/// `c = local_size_x * 2; barrier; out[flat] = c`.
pub fn kernel_s5(info: &KernelInfo) -> Function {
    let mut f = Function::new("s5");
    let out = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let body = f.create_block("body");
    let bar = f.create_block("bar");
    let post = f.create_block("post");
    let retb = f.create_block("retb");
    let ls = f.global_value(info.local_size_globals[0], "_local_size_x");
    let lidx = f.global_value(info.local_id_globals[0], "_local_id_x");
    let lidy = f.global_value(info.local_id_globals[1], "_local_id_y");
    let lidz = f.global_value(info.local_id_globals[2], "_local_id_z");
    let size_y = f.const_int(info.local_sizes[1] as i64);
    let size_z = f.const_int(info.local_sizes[2] as i64);
    let two = f.const_int(2);

    let (lx, ly, lz);
    {
        let mut bld = Builder::at_end(&mut f, entry);
        lx = bld.load(Type::Int64, lidx, "lx");
        ly = bld.load(Type::Int64, lidy, "ly");
        lz = bld.load(Type::Int64, lidz, "lz");
        bld.br(body);
    }
    let c;
    {
        let mut bld = Builder::at_end(&mut f, body);
        let size = bld.load(Type::Int64, ls, "size_x");
        c = bld.mul(size, two, "c");
        bld.br(bar);
    }
    {
        let mut bld = Builder::at_end(&mut f, bar);
        bld.call_barrier();
        bld.br(post);
    }
    {
        let mut bld = Builder::at_end(&mut f, post);
        let a = bld.mul(lx, size_y, "flat.a");
        let b = bld.add(a, ly, "flat.b");
        let cdim = bld.mul(b, size_z, "flat.c");
        let flat = bld.add(cdim, lz, "flat");
        let gep = bld.gep(Type::Int64, out, flat, "out.gep");
        bld.store(c, gep);
        bld.br(retb);
    }
    {
        let mut bld = Builder::at_end(&mut f, retb);
        bld.call_barrier();
        bld.ret();
    }
    f
}

/// One region with two exits leading to two different barriers: the flag
/// in `sel[0]` steers the whole group to one of two writer regions.
pub fn kernel_s6(info: &KernelInfo) -> Function {
    let mut f = Function::new("s6");
    let out = f.add_param(Type::Ptr);
    let sel = f.add_param(Type::Ptr);
    let entry = f.create_block("entry");
    let body = f.create_block("body");
    let bar_a = f.create_block("bar.a");
    let blk_a = f.create_block("blk.a");
    let bar_b = f.create_block("bar.b");
    let blk_b = f.create_block("blk.b");
    let retb = f.create_block("retb");
    let lid = f.global_value(info.local_id_globals[0], "_local_id_x");
    let zero = f.const_int(0);
    let one = f.const_int(1);
    let two = f.const_int(2);

    let gid;
    {
        let mut bld = Builder::at_end(&mut f, entry);
        gid = bld.load(Type::Int64, lid, "gid");
        bld.br(body);
    }
    {
        let mut bld = Builder::at_end(&mut f, body);
        let sel_gep = bld.gep(Type::Int64, sel, zero, "sel.gep");
        let flag = bld.load(Type::Int64, sel_gep, "flag");
        let cond = bld.icmp(veld_ir::IcmpPred::Eq, flag, zero, "flag.cond");
        bld.cond_br(cond, bar_a, bar_b);
    }
    {
        let mut bld = Builder::at_end(&mut f, bar_a);
        bld.call_barrier();
        bld.br(blk_a);
    }
    let store_to = |f: &mut Function, block, value: ValueId| {
        let mut bld = Builder::at_end(f, block);
        let gep = bld.gep(Type::Int64, out, gid, "out.gep");
        bld.store(value, gep);
        bld.br(retb);
    };
    store_to(&mut f, blk_a, one);
    {
        let mut bld = Builder::at_end(&mut f, bar_b);
        bld.call_barrier();
        bld.br(blk_b);
    }
    store_to(&mut f, blk_b, two);
    {
        let mut bld = Builder::at_end(&mut f, retb);
        bld.call_barrier();
        bld.ret();
    }
    f
}
