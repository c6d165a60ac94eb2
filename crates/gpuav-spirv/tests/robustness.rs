use gpuav_spirv::{encode_literal_string, op, version, Instruction, Module, SpirvError, MAGIC};
use proptest::prelude::*;

fn compute_module() -> Vec<u32> {
    let mut words = vec![MAGIC, version(1, 3), 0, 12, 0];
    let mut push = |opcode: u16, operands: Vec<u32>| {
        Instruction::new(opcode, operands)
            .encode_into(&mut words)
            .unwrap()
    };
    push(op::CAPABILITY, vec![op::capability::SHADER]);
    push(op::MEMORY_MODEL, vec![0, 1]);
    let mut ep = vec![op::execution_model::GL_COMPUTE, 3];
    ep.extend(encode_literal_string("main"));
    push(op::ENTRY_POINT, ep);
    push(op::EXECUTION_MODE, vec![3, op::execution_mode::LOCAL_SIZE, 1, 1, 1]);
    let mut name = vec![3];
    name.extend(encode_literal_string("main"));
    push(op::NAME, name);
    push(op::DECORATE, vec![8, op::decoration::DESCRIPTOR_SET, 0]);
    push(op::TYPE_VOID, vec![1]);
    push(op::TYPE_FUNCTION, vec![2, 1]);
    push(op::TYPE_BOOL, vec![4]);
    push(op::CONSTANT_TRUE, vec![4, 5]);
    push(op::FUNCTION, vec![1, 3, 0, 2]);
    push(op::LABEL, vec![6]);
    push(op::SELECTION_MERGE, vec![9, 0]);
    push(op::BRANCH_CONDITIONAL, vec![5, 7, 9]);
    push(op::LABEL, vec![7]);
    push(op::BRANCH, vec![9]);
    push(op::LABEL, vec![9]);
    push(op::PHI, vec![4, 10, 5, 6, 5, 7]);
    push(op::RETURN, vec![]);
    push(op::FUNCTION_END, vec![]);
    words
}

#[test]
fn well_formed_module_survives_roundtrip_and_structure_check() {
    let words = compute_module();
    let module = Module::parse(&words).unwrap();
    module.check_structure().unwrap();
    assert_eq!(module.to_words().unwrap(), words);
    assert_eq!(module.debug_name(3).as_deref(), Some("main"));
    assert_eq!(module.functions[0].blocks.len(), 3);
}

#[test]
fn module_scope_out_of_order_is_rejected() {
    let mut words = compute_module();
    // Append a capability after the function section.
    Instruction::new(op::CAPABILITY, vec![op::capability::INT64])
        .encode_into(&mut words)
        .unwrap();
    assert!(matches!(
        Module::parse(&words),
        Err(SpirvError::Layout { .. })
    ));
}

#[test]
fn short_inputs_report_too_small() {
    assert_eq!(
        Module::parse(&[MAGIC, 0]),
        Err(SpirvError::TooSmall { needed: 5, got: 2 })
    );
    assert_eq!(
        Module::parse_bytes(&[0x03, 0x02, 0x23]),
        Err(SpirvError::UnalignedBytes(3))
    );
}

proptest! {
    #[test]
    fn arbitrary_words_never_panic(body in proptest::collection::vec(any::<u32>(), 0..256)) {
        let mut words = vec![MAGIC, version(1, 0), 0, 64, 0];
        words.extend(body);
        if let Ok(module) = Module::parse(&words) {
            let _ = module.check_structure();
            let _ = module.to_words();
            let _ = module.instruction_offsets();
            let _ = module.entry_point_infos();
        }
    }

    #[test]
    fn corrupted_valid_module_never_panics(
        flips in proptest::collection::vec((any::<prop::sample::Index>(), any::<u32>()), 1..8)
    ) {
        let mut words = compute_module();
        for (index, value) in flips {
            let at = index.index(words.len());
            words[at] = value;
        }
        if let Ok(module) = Module::parse(&words) {
            let _ = module.check_structure();
            let _ = module.to_words();
        }
    }

    #[test]
    fn parsed_modules_reserialize_to_the_same_words(extra_names in 0usize..4) {
        let mut words = compute_module();
        // Insert OpName instructions right after the existing one (still in section order).
        let insert_at = words
            .iter()
            .position(|w| *w & 0xffff == u32::from(op::DECORATE) && (*w >> 16) == 4)
            .unwrap();
        for i in 0..extra_names {
            let mut inst = vec![1 + i as u32];
            inst.extend(encode_literal_string(&format!("n{i}")));
            let mut encoded = Vec::new();
            Instruction::new(op::NAME, inst).encode_into(&mut encoded).unwrap();
            words.splice(insert_at..insert_at, encoded);
        }
        let module = Module::parse(&words).unwrap();
        prop_assert_eq!(module.to_words().unwrap(), words);
    }
}
