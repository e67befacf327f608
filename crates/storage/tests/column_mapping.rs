use utxod_storage::Column;

#[test]
fn column_index_and_bit_are_stable() {
    let mut seen = 0u32;
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        let bit = column.bit();
        assert_eq!(bit, 1u32 << idx);
        assert_eq!(seen & bit, 0, "duplicate bit for {column:?}");
        seen |= bit;
    }
    assert_eq!(seen.count_ones() as usize, Column::ALL.len());
}

#[test]
fn column_names_are_unique() {
    let mut names: Vec<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), Column::ALL.len());
}
