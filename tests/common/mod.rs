use strata::{InternalValue, LevelController, ValueType};

/// Builds one L0 table from the given `(key, value, seqno)` triples and
/// installs it.
#[allow(dead_code)]
pub fn flush_l0(
    controller: &LevelController,
    items: &[(&str, &str, u64)],
) -> strata::Result<()> {
    let mut values = items
        .iter()
        .map(|(key, value, seqno)| {
            InternalValue::from_components(
                key.as_bytes(),
                value.as_bytes(),
                *seqno,
                ValueType::Value,
            )
        })
        .collect::<Vec<_>>();
    values.sort();

    flush_l0_values(controller, values)
}

#[allow(dead_code)]
pub fn flush_l0_values(
    controller: &LevelController,
    values: Vec<InternalValue>,
) -> strata::Result<()> {
    let mut writer = controller.new_l0_writer()?;
    let id = writer.id();

    for value in values {
        writer.add(value)?;
    }
    writer.finish()?;

    controller.add_l0_table(controller.open_table(id)?)
}
