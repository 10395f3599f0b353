// End-to-end linking scenarios.
//
// Each test links a small hand-assembled kernel list in memory and checks
// the emitted queues, either against an inline snapshot or against the
// offset arithmetic the queues must satisfy.

use helink::config::{HardwareSpec, LinkOptions};
use helink::error::{codes, ErrorKind};
use helink::loader::KernelDescriptor;
use helink::mem_map::MemoryMap;
use helink::program::{LinkedProgram, OutputStreams};
use helink::session::{link, Linked};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn kernel(name: &str, minst: &str, cinst: &str, xinst: &str) -> KernelDescriptor {
    KernelDescriptor::from_text(name, minst, cinst, xinst)
        .unwrap_or_else(|e| panic!("kernel {name}: {e}"))
}

fn link_all(spec: HardwareSpec, mem: &str, kernels: Vec<KernelDescriptor>) -> Linked<Vec<u8>> {
    let map = MemoryMap::parse(mem, "program.mem").unwrap();
    link(
        OutputStreams::default(),
        spec,
        LinkOptions::default(),
        map,
        kernels,
    )
    .unwrap_or_else(|e| panic!("link failed: {}", e.render()))
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ── HBM present ─────────────────────────────────────────────────────────────

const PROGRAM_MEM: &str = "\
dload, poly, 0, ct_in
dstore, ct_out, 1
";

/// Kernel A reads the program input and stores an intermediate.
fn kernel_a() -> KernelDescriptor {
    kernel(
        "a",
        "\
0, mload, 0, ct_in # load input
1, msyncc, 1
2, mstore, ct_result, 1
3, msyncc, 3
",
        "\
0, csyncm, 0
1, ifetch, 0
2, cstore, 1
3, cexit
",
        "\
F0, 0, add, r2b0, r0b0, r1b0, 0
F1, 0, xstore, r2b0
",
    )
}

/// Kernel B loads the intermediate and stores the program output.
fn kernel_b() -> KernelDescriptor {
    kernel(
        "b",
        "\
0, mload, 0, ct_result
1, msyncc, 1
2, mstore, ct_out, 0
3, msyncc, 2
",
        "\
0, csyncm, 0
1, ifetch, 0
2, cexit
",
        "F0, 0, mul, r1b0, r0b0, r0b0, 0\n",
    )
}

#[test]
fn store_then_load_share_one_address() {
    let linked = link_all(
        HardwareSpec::with_hbm(8),
        PROGRAM_MEM,
        vec![kernel_a(), kernel_b()],
    );
    let minst = text(&linked.streams.minst);

    let store = minst
        .lines()
        .position(|l| l.contains("mstore, 2,") && l.contains("ct_result"))
        .expect("store of ct_result");
    let load = minst
        .lines()
        .position(|l| l.contains("mload, 0, 2") && l.contains("ct_result"))
        .expect("load of ct_result");
    assert!(store < load, "load must follow store:\n{minst}");
    assert_eq!(minst.matches("var: ct_result - HBM(2)").count(), 2);
}

#[test]
fn hbm_program_queues() {
    let linked = link_all(
        HardwareSpec::with_hbm(8),
        PROGRAM_MEM,
        vec![kernel_a(), kernel_b()],
    );

    insta::assert_snapshot!(text(&linked.streams.minst), @r"
    0, mload, 0, 0 # var: ct_in - HBM(0); load input
    1, msyncc, 1
    2, mstore, 2, 1 # var: ct_result - HBM(2)
    3, mload, 0, 2 # var: ct_result - HBM(2)
    4, msyncc, 4
    5, mstore, 1, 0 # var: ct_out - HBM(1)
    6, msyncc, 6 # terminating MInstQ
    ");
    insta::assert_snapshot!(text(&linked.streams.cinst), @r"
    0, csyncm, 0
    1, ifetch, 0
    2, cstore, 1
    3, csyncm, 3
    4, ifetch, 2
    5, cexit
    ");
    insta::assert_snapshot!(text(&linked.streams.xinst), @r"
    F0, 0, add, r2b0, r0b0, r1b0, 0
    F1, 0, xstore, r2b0
    F2, 0, mul, r1b0, r0b0, r0b0, 0
    ");
}

#[test]
fn first_control_line_of_each_kernel_follows_offsets() {
    let kernels = vec![kernel_a(), kernel_b(), kernel_a(), kernel_b()];
    let lens: Vec<u32> = kernels.iter().map(|k| k.cinstrs.len() as u32).collect();
    // no memory map: every variable is allocated on demand
    let linked = link_all(HardwareSpec::with_hbm(8), "", kernels);

    let mut expected = 0;
    for (report, len) in linked.reports.iter().zip(&lens) {
        assert_eq!(report.first_cinst_line, expected, "kernel {}", report.kernel);
        expected += len - 1;
    }
    let cinst = text(&linked.streams.cinst);
    assert_eq!(cinst.lines().last(), Some(format!("{expected}, cexit").as_str()));
}

#[test]
fn compute_bundles_continue_across_kernels() {
    let linked = link_all(
        HardwareSpec::with_hbm(8),
        PROGRAM_MEM,
        vec![kernel_a(), kernel_b()],
    );
    let bundles: Vec<u32> = text(&linked.streams.xinst)
        .lines()
        .map(|l| l.split(',').next().unwrap()[1..].parse().unwrap())
        .collect();
    assert_eq!(bundles, vec![0, 1, 2]);
    assert_eq!(linked.reports[1].last_bundle, 2);
}

#[test]
fn build_counts_match_emitted_lines() {
    let linked = link_all(
        HardwareSpec::with_hbm(8),
        PROGRAM_MEM,
        vec![kernel_a(), kernel_b()],
    );
    assert_eq!(linked.lines.minst, 7);
    assert_eq!(linked.lines.cinst, 6);
    assert_eq!(linked.lines.xinst, 3);
    assert_eq!(linked.variables, 3);
}

// ── No HBM ──────────────────────────────────────────────────────────────────

const SPAD_MEM: &str = "\
dload, poly, 0, ct_in
dstore, ct_out, 1
dload, ones, 3
";

fn spad_kernels() -> Vec<KernelDescriptor> {
    vec![
        kernel(
            "a",
            "",
            "\
0, ifetch, 0
1, cload, r0b0, ct_in
2, csyncm, 0
3, cnop, 1
4, cstore, tmp
5, ifetch, 1
6, cexit
",
            "\
F0, 0, move, r1b0, r0b0
F1, 0, xstore, r1b0
",
        ),
        kernel(
            "b",
            "",
            "\
0, csyncm, 0
1, ifetch, 0
2, cload, r0b0, tmp
3, csyncm, 1
4, csyncm, 2
5, ifetch, 1
6, cstore, ct_out
7, cexit
",
            "\
F0, 0, mul, r1b0, r0b0, r0b0, 0
F1, 0, xstore, r1b0
",
        ),
    ]
}

#[test]
fn spad_program_queues() {
    let linked = link_all(
        HardwareSpec::without_hbm(4).sync_throughput(2),
        SPAD_MEM,
        spad_kernels(),
    );

    insta::assert_snapshot!(text(&linked.streams.cinst), @r"
    0, ifetch, 0
    1, cload, r0b0, 0 # var: ct_in - SPAD(0)
    2, cnop, 3
    3, cstore, 0 # var: tmp - SPAD(0)
    4, ifetch, 1
    5, ifetch, 2
    6, cload, r0b0, 0 # var: tmp - SPAD(0)
    7, cnop, 3
    8, ifetch, 3
    9, cstore, 1 # var: ct_out - SPAD(1)
    10, cexit
    ");
    assert_eq!(
        text(&linked.streams.minst),
        "0, msyncc, 11 # terminating MInstQ\n"
    );
    assert_eq!(linked.lines.xinst, 4);
}

#[test]
fn spad_elision_stats_per_kernel() {
    let linked = link_all(
        HardwareSpec::without_hbm(4).sync_throughput(2),
        SPAD_MEM,
        spad_kernels(),
    );
    let a = linked.reports[0].elision.expect("elision ran");
    let b = linked.reports[1].elision.expect("elision ran");
    assert_eq!((a.syncs_removed, a.syncs_charged, a.idles_inserted), (1, 1, 0));
    assert_eq!((b.syncs_removed, b.syncs_charged, b.idles_inserted), (3, 2, 1));
}

#[test]
fn unused_metadata_is_required_with_hbm() {
    let map = MemoryMap::parse(SPAD_MEM, "program.mem").unwrap();
    let err = link(
        OutputStreams::<Vec<u8>>::default(),
        HardwareSpec::with_hbm(4),
        LinkOptions::default(),
        map,
        vec![kernel_a(), kernel_b()],
    )
    .unwrap_err();
    assert_eq!(err.code(), codes::L0102);
    assert!(err.to_string().contains("ones_3"), "{err}");
}

// ── Failure modes ───────────────────────────────────────────────────────────

#[test]
fn exhausted_memory_names_variable_and_kernel() {
    let map = MemoryMap::parse(PROGRAM_MEM, "program.mem").unwrap();
    let err = link(
        OutputStreams::<Vec<u8>>::default(),
        HardwareSpec::with_hbm(2),
        LinkOptions::default(),
        map,
        vec![kernel_a(), kernel_b()],
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationExhausted);
    let msg = err.to_string();
    assert!(msg.contains("ct_result") && msg.contains("kernel 0"), "{msg}");
}

#[test]
fn linking_after_close_is_fatal() {
    let model = helink::memory::MemoryModel::new(HardwareSpec::with_hbm(4), MemoryMap::new())
        .unwrap();
    let mut program =
        LinkedProgram::new(OutputStreams::<Vec<u8>>::default(), model, LinkOptions::default());
    program.close().unwrap();
    let k = kernel("late", "", "0, cexit\n", "");
    let err = program.link_kernel(k).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(program.close().unwrap_err().code(), codes::L0307);
}
