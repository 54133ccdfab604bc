use keytrace_core::analysis::{CancelToken, Engine, EngineError};
use keytrace_core::facts::{Arch, ProgramFacts, ProgramSnapshot, SnapshotBuilder};
use keytrace_core::model::{Function, Instruction};
use keytrace_core::profile::AnalysisProfile;

const STRCPY: u64 = 0x2000;
const NVRAM_GET: u64 = 0x2100;
const NVRAM_SET: u64 = 0x2200;
const SETENV: u64 = 0x2300;

/// Library stubs every fixture links against: one plain instruction each.
fn with_imports(builder: SnapshotBuilder) -> SnapshotBuilder {
    [("strcpy", STRCPY), ("nvram_get", NVRAM_GET), ("nvram_set", NVRAM_SET), ("setenv", SETENV)]
        .into_iter()
        .fold(builder, |b, (name, entry)| {
            b.function(name, entry, entry + 4).instruction(Instruction::plain(entry, 4))
        })
}

/// `F` reads `lan_ip`, copies it with an unchecked `strcpy`, then stores `lan_ipaddr`.
fn copy_then_store() -> ProgramSnapshot {
    with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("F", 0x1000, 0x1020)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, NVRAM_GET))
        .instruction(Instruction::plain(0x1008, 4))
        .instruction(Instruction::call(0x100c, 4, STRCPY))
        .instruction(Instruction::plain(0x1010, 4))
        .instruction(Instruction::call(0x1014, 4, NVRAM_SET))
        .instruction(Instruction::plain(0x1018, 4))
        .instruction(Instruction::plain(0x101c, 4))
        .set(0x1000, "r0", 0x9000)
        .set(0x1008, "r0", 0xa000)
        .set(0x1010, "r1", 0x9100)
        .set(0x1010, "r2", 0xa000)
        .string(0x9000, "lan_ip")
        .string(0x9100, "lan_ipaddr")
        .reference(0x1000, 0x9000)
        .build()
        .expect("fixture")
}

#[test]
fn reports_path_through_unsafe_copy_into_sink() {
    let snap = copy_then_store();
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "httpd").expect("engine");

    let summary = engine.run(["lan_ip"]).expect("run");

    assert_eq!(
        engine.report_lines(),
        vec![
            "[Param \"lan_ip\"(0x9000), Referenced at F : 0x1000] >> 0x100c >> strcpy \
             >> 0x1014 -> nvram_set lan_ipaddr"
                .to_string()
        ]
    );
    assert_eq!(summary.seed_count, 1);
    assert_eq!(summary.referenced, 1);
    assert_eq!(summary.reachable, 1);
    assert!(summary.discovered.is_empty());

    let state = engine.state();
    let keys: Vec<_> = state.shares.keys_for("nvram_set").expect("share").iter().collect();
    assert_eq!(keys, vec!["lan_ipaddr"]);
    assert_eq!(
        state.keyword_map.get("lan_ipaddr"),
        Some(&["httpd nvram_set 0x1014".to_string()][..])
    );
    let path = &state.paths[0];
    assert_eq!(path.digest().map(|d| d.address), Some(0x100c));
}

#[test]
fn key_prefix_without_terminator_is_not_an_occurrence() {
    let snap = copy_then_store();
    let engine = Engine::new(&snap, AnalysisProfile::default(), "httpd").expect("engine");

    assert_eq!(engine.occurrences("lan_ip").expect("scan"), vec![0x9000]);
    assert_eq!(engine.occurrences("lan_ipaddr").expect("scan"), vec![0x9100]);
    assert!(engine.occurrences("wan_ip").expect("scan").is_empty());
}

#[test]
fn segment_at_the_top_of_the_address_space_is_scanned_without_overflow() {
    let top = u64::MAX - 3;
    let snap = with_imports(SnapshotBuilder::new(Arch::Arm))
        .bytes(top, b"key\0tail".to_vec())
        .build()
        .expect("fixture");
    assert_eq!(snap.address_range().1, u64::MAX);

    let engine = Engine::new(&snap, AnalysisProfile::default(), "httpd").expect("engine");

    assert_eq!(engine.occurrences("key").expect("scan"), vec![top]);
    assert!(engine.occurrences("tail").expect("scan").is_empty());
}

#[test]
fn unreferenced_key_is_neither_referenced_nor_reachable() {
    let snap = copy_then_store();
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "httpd").expect("engine");

    let summary = engine.run(["lan_ipaddr"]).expect("run");

    assert_eq!(summary.referenced, 0);
    assert_eq!(summary.reachable, 0);
    assert!(engine.report_lines().is_empty());
}

#[test]
fn checked_copy_leaves_no_digest_on_the_path() {
    let snap = with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("F", 0x1000, 0x1018)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, STRCPY))
        .instruction(Instruction::plain(0x1008, 4))
        .instruction(Instruction::call(0x100c, 4, SETENV))
        .instruction(Instruction::plain(0x1010, 4))
        .set(0x1000, "r1", 0x9100)
        .set(0x1008, "r0", 0x9000)
        .string(0x9000, "wan_proto")
        .string(0x9100, "dhcp")
        .reference(0x1000, 0x9000)
        .build()
        .expect("fixture");
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "rc").expect("engine");

    engine.run(["wan_proto"]).expect("run");

    assert_eq!(
        engine.report_lines(),
        vec!["[Param \"wan_proto\"(0x9000), Referenced at F : 0x1000] >> 0x100c -> setenv wan_proto"
            .to_string()]
    );
}

#[test]
fn mutually_recursive_callers_terminate_and_become_safe() {
    let snap = with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("A", 0x1000, 0x1008)
        .function("B", 0x1100, 0x1108)
        .function("C", 0x1200, 0x1204)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, 0x1100))
        .instruction(Instruction::call(0x1100, 4, 0x1000))
        .instruction(Instruction::call(0x1104, 4, 0x1200))
        .instruction(Instruction::call(0x1200, 4, 0x1100))
        .string(0x9000, "loop_key")
        .reference(0x1000, 0x9000)
        .build()
        .expect("fixture");
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    let summary = engine.run(["loop_key"]).expect("run");

    assert_eq!(summary.referenced, 1);
    assert_eq!(summary.reachable, 0);
    let safe = &engine.state().safe;
    assert!(safe.contains(0x1100));
    assert!(safe.contains(0x1200));
    assert!(!safe.contains(0x1000), "the start function is never marked safe");
}

/// `S` calls `nvram_set` before its reference site and `G` after it; `G`
/// calls back into `S`. `T` only calls `G`.
fn callback_fixture() -> ProgramSnapshot {
    with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("S", 0x1000, 0x1010)
        .function("G", 0x1100, 0x1104)
        .function("T", 0x1200, 0x1208)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, NVRAM_SET))
        .instruction(Instruction::plain(0x1008, 4))
        .instruction(Instruction::call(0x100c, 4, 0x1100))
        .instruction(Instruction::call(0x1100, 4, 0x1000))
        .instruction(Instruction::plain(0x1200, 4))
        .instruction(Instruction::call(0x1204, 4, 0x1100))
        .string(0x9000, "key_one")
        .string(0x9100, "key_two")
        .reference(0x1008, 0x9000)
        .reference(0x1200, 0x9100)
        .build()
        .expect("fixture")
}

#[test]
fn safe_set_is_shared_across_searches_from_different_functions() {
    let snap = callback_fixture();
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    // key_one runs first: G only leads back into the start function S, so G is marked safe
    // and the later search from T never enters it.
    let summary = engine.run(["key_one", "key_two"]).expect("run");

    assert!(engine.state().safe.contains(0x1100));
    assert_eq!(summary.referenced, 2);
    assert_eq!(summary.reachable, 0);
    assert!(engine.state().paths.is_empty());
}

#[test]
fn unresolved_sink_key_prints_placeholder_and_is_not_shared() {
    let snap = callback_fixture();
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    let summary = engine.run(["key_two"]).expect("run");

    assert_eq!(summary.reachable, 1);
    assert_eq!(
        engine.report_lines(),
        vec!["[Param \"key_two\"(0x9100), Referenced at T : 0x1200] >> 0x1204 -> G \
              >> 0x1100 -> S >> 0x1004 -> nvram_set *unknown*"
            .to_string()]
    );
    assert!(engine.state().shares.is_empty());
    assert!(engine.state().keyword_map.is_empty());
}

#[test]
fn safe_set_only_grows() {
    let snap = callback_fixture();
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    engine.search_key("key_one", None).expect("first");
    let after_first = engine.state().safe.len();
    engine.search_key("key_two", None).expect("second");

    assert!(after_first > 0);
    assert!(engine.state().safe.len() >= after_first);
    assert!(engine.state().safe.contains(0x1100));
}

#[test]
fn indirect_call_resolves_through_register_value() {
    let snap = with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("F", 0x1000, 0x100c)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call_indirect(0x1004, 4, "r3"))
        .instruction(Instruction::plain(0x1008, 4))
        .set(0x1000, "r3", NVRAM_SET)
        .set(0x1000, "r1", 0x9100)
        .string(0x9000, "wl_ssid")
        .string(0x9100, "wl0_ssid")
        .reference(0x1000, 0x9000)
        .build()
        .expect("fixture");
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    engine.run(["wl_ssid"]).expect("run");

    assert_eq!(
        engine.report_lines(),
        vec!["[Param \"wl_ssid\"(0x9000), Referenced at F : 0x1000] >> 0x1004 -> nvram_set wl0_ssid"
            .to_string()]
    );
}

#[test]
fn data_pointer_reference_is_followed_one_level() {
    let snap = with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("F", 0x1000, 0x100c)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, SETENV))
        .instruction(Instruction::plain(0x1008, 4))
        .set(0x1000, "r0", 0x9000)
        .bytes(0x8000, vec![0x00, 0x90, 0x00, 0x00])
        .symbol(0x8000, "lan_ip_ptr")
        .string(0x9000, "lan_ip")
        .reference(0x8000, 0x9000)
        .reference(0x1000, 0x8000)
        .build()
        .expect("fixture");
    let mut engine = Engine::new(&snap, AnalysisProfile::default(), "bin").expect("engine");

    let (references, any) = engine.resolve_references(0x9000, None);
    assert!(any);
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].from, 0x1000);
    assert_eq!(references[0].function, 0x1000);
    assert!(references[0].indirect);

    let summary = engine.run(["lan_ip"]).expect("run");
    assert_eq!(summary.reachable, 1);
    assert_eq!(
        engine.report_lines(),
        vec!["[Param \"lan_ip\"(0x9000), Referenced at F : 0x1000] >> 0x1004 -> setenv lan_ip"
            .to_string()]
    );
}

#[test]
fn facts_without_register_propagation_are_rejected() {
    let snap =
        SnapshotBuilder::new(Arch::Arm).without_register_propagation().build().expect("snap");
    let err = Engine::new(&snap, AnalysisProfile::default(), "bin").err().expect("must fail");
    assert!(matches!(err, EngineError::NoRegisterPropagation));
}

/// Delegates to a snapshot and cancels the run when a given call's arguments are inspected.
struct CancelOnQuery {
    inner: ProgramSnapshot,
    trigger: u64,
    token: CancelToken,
}

impl ProgramFacts for CancelOnQuery {
    fn arch(&self) -> &Arch {
        self.inner.arch()
    }

    fn supports_register_values(&self) -> bool {
        self.inner.supports_register_values()
    }

    fn address_range(&self) -> (u64, u64) {
        self.inner.address_range()
    }

    fn functions(&self) -> Vec<&Function> {
        self.inner.functions()
    }

    fn function_at(&self, entry: u64) -> Option<&Function> {
        self.inner.function_at(entry)
    }

    fn function_containing(&self, address: u64) -> Option<&Function> {
        self.inner.function_containing(address)
    }

    fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.inner.instruction_at(address)
    }

    fn instruction_after(&self, address: u64) -> Option<&Instruction> {
        self.inner.instruction_after(address)
    }

    fn read_byte(&self, address: u64) -> Option<u8> {
        self.inner.read_byte(address)
    }

    fn find_bytes(&self, start: u64, end: u64, pattern: &[u8]) -> Option<u64> {
        self.inner.find_bytes(start, end, pattern)
    }

    fn references_to(&self, address: u64) -> Vec<u64> {
        self.inner.references_to(address)
    }

    fn register_value(&self, address: u64, register: &str) -> Option<u64> {
        if address == self.trigger {
            self.token.cancel();
        }
        self.inner.register_value(address, register)
    }

    fn symbol_at(&self, address: u64) -> Option<&str> {
        self.inner.symbol_at(address)
    }
}

#[test]
fn cancellation_unwinds_without_marking_frames_safe() {
    let inner = with_imports(SnapshotBuilder::new(Arch::Arm))
        .function("F", 0x1000, 0x1008)
        .function("G", 0x1100, 0x1108)
        .instruction(Instruction::plain(0x1000, 4))
        .instruction(Instruction::call(0x1004, 4, 0x1100))
        .instruction(Instruction::call(0x1100, 4, STRCPY))
        .instruction(Instruction::call(0x1104, 4, NVRAM_SET))
        .string(0x9000, "lan_ip")
        .reference(0x1000, 0x9000)
        .build()
        .expect("fixture");
    let token = CancelToken::new();
    let facts = CancelOnQuery { inner, trigger: 0x1100, token: token.clone() };
    let mut engine = Engine::new(&facts, AnalysisProfile::default(), "bin")
        .expect("engine")
        .with_cancel_token(token.clone());

    let err = engine.run(["lan_ip"]).err().expect("cancelled");

    assert!(matches!(err, EngineError::Cancelled));
    assert!(token.is_cancelled());
    let state = engine.state();
    assert!(!state.safe.contains(0x1100));
    assert!(!state.safe.contains(STRCPY));
    assert!(state.paths.is_empty());
}
