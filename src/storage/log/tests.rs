//! Unit tests for the log storage module.

#[cfg(test)]
mod entry_tests {
    use crate::error::StoreError;
    use crate::storage::log::entry::*;

    fn create_test_entry(index: u64, term: u64) -> LogEntry {
        LogEntry::with_index(index, term, format!("command_{}", index).into_bytes())
    }

    #[test]
    fn test_data_codec_encode_decode() {
        let codec = DataCodec::default();
        let entry = create_test_entry(3, 2);

        let bytes = codec.encode(&entry).unwrap();
        assert_eq!(bytes.len(), entry.encoded_len());
        assert_eq!(bytes.len(), ENTRY_HEADER_SIZE + "command_3".len());

        let decoded = codec.decode(100, &bytes).unwrap();
        assert!(decoded.same_payload(&entry));
        assert_eq!(decoded.pos, 100);
        assert_eq!(decoded.size as usize, bytes.len());
    }

    #[test]
    fn test_data_codec_rejects_bad_magic() {
        let codec = DataCodec::default();
        let mut bytes = codec.encode(&create_test_entry(1, 1)).unwrap();
        bytes[0] ^= 0xFF;

        assert!(matches!(
            codec.decode(0, &bytes),
            Err(StoreError::CorruptRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn test_data_codec_rejects_bad_checksum() {
        let codec = DataCodec::default();
        let mut bytes = codec.encode(&create_test_entry(1, 1)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            codec.decode(64, &bytes),
            Err(StoreError::CorruptRecord { offset: 64, .. })
        ));
    }

    #[test]
    fn test_data_codec_rejects_short_record() {
        let codec = DataCodec::default();
        let bytes = codec.encode(&create_test_entry(1, 1)).unwrap();
        assert!(codec.decode(0, &bytes[..ENTRY_HEADER_SIZE - 1]).is_err());
        assert!(codec.decode(0, &bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_data_codec_classify() {
        let codec = DataCodec::default();
        let bytes = codec.encode(&create_test_entry(1, 1)).unwrap();

        let mut region = bytes.clone();
        region.resize(256, 0);
        assert_eq!(codec.classify(&region), RecordKind::Record { len: bytes.len() });
        assert_eq!(codec.classify(&region[bytes.len()..]), RecordKind::End);

        let marker = codec.blank_marker(100);
        assert_eq!(marker.len(), MIN_BLANK_LEN);
        assert_eq!(codec.classify(&marker), RecordKind::Blank);

        assert!(codec.blank_marker(MIN_BLANK_LEN - 1).is_empty());
        // header claims more bytes than the segment has left
        assert_eq!(codec.classify(&bytes[..bytes.len() - 1]), RecordKind::End);
    }

    #[test]
    fn test_index_codec_padding() {
        let codec = IndexCodec::new(64);
        let unit = IndexUnit {
            entry_index: 7,
            entry_term: 3,
            data_offset: 4096,
            entry_size: 41,
            flags: INDEX_UNIT_VALID,
        };

        let bytes = codec.encode(&unit).unwrap();
        assert_eq!(bytes.len(), 64);
        assert!(bytes[INDEX_UNIT_SIZE..].iter().all(|b| *b == 0));
        assert_eq!(codec.decode(0, &bytes).unwrap(), unit);
        assert_eq!(codec.classify(&bytes), RecordKind::Record { len: 64 });
        assert_eq!(codec.classify(&[0u8; 64]), RecordKind::End);
        assert!(codec.decode(0, &bytes[..32]).is_err());
    }

    #[test]
    fn test_index_unit_for_entry() {
        let mut entry = create_test_entry(9, 4);
        entry.pos = 1024;
        entry.size = 41;

        let unit = IndexUnit::for_entry(&entry);
        assert!(unit.is_valid());
        assert_eq!(unit.entry_index, 9);
        assert_eq!(unit.entry_term, 4);
        assert_eq!(unit.data_offset, 1024);
        assert_eq!(unit.entry_size, 41);
        assert!(!IndexUnit::default().is_valid());
    }

    #[test]
    fn test_boundary_policies() {
        assert_eq!(DataCodec::new(16).boundary_policy().reserve(), 16);
        assert_eq!(IndexCodec::default().boundary_policy(), BoundaryPolicy::Exact);
        assert_eq!(BoundaryPolicy::Exact.reserve(), 0);
        assert_eq!(IndexCodec::default().width(), RecordWidth::Fixed(INDEX_UNIT_SIZE));
        assert_eq!(DataCodec::default().width(), RecordWidth::Variable);
    }
}

#[cfg(test)]
mod segment_tests {
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    use crate::error::StoreError;
    use crate::storage::log::segment::*;

    #[test]
    fn test_segment_file_names() {
        assert_eq!(segment_file_name(4096), "00000000000000004096");
        assert_eq!(parse_segment_file_name("00000000000000004096"), Some(4096));
        assert_eq!(parse_segment_file_name("segment.log"), None);
        assert_eq!(parse_segment_file_name(""), None);
    }

    #[test]
    fn test_segment_write_and_read() {
        let dir = TempDir::new().unwrap();
        let segment = MappedSegment::create(dir.path(), 1024, 1024).unwrap();
        assert_eq!(segment.end_offset(), 2048);

        assert_eq!(segment.write(b"abc").unwrap(), 0);
        assert_eq!(segment.write(b"de").unwrap(), 3);
        assert_eq!(segment.wrote(), 5);
        assert_eq!(segment.committed(), 5);
        assert_eq!(segment.remaining(), 1019);

        assert_eq!(segment.read(0, 5).unwrap(), b"abcde");
        assert!(matches!(
            segment.read(3, 10),
            Err(StoreError::OutOfRange {
                offset: 1027,
                limit: 1029,
                ..
            })
        ));
    }

    #[test]
    fn test_segment_write_overflow() {
        let dir = TempDir::new().unwrap();
        let segment = MappedSegment::create(dir.path(), 0, 16).unwrap();
        segment.write(&[1u8; 10]).unwrap();
        assert!(matches!(
            segment.write(&[2u8; 10]),
            Err(StoreError::RecordTooLarge { size: 10, max: 6 })
        ));
        assert_eq!(segment.wrote(), 10);
    }

    #[test]
    fn test_segment_flush_is_incremental() {
        let dir = TempDir::new().unwrap();
        let segment = MappedSegment::create(dir.path(), 0, 1024).unwrap();
        segment.write(b"hello").unwrap();

        assert!(!segment.is_fully_flushed());
        assert_eq!(segment.flush().unwrap(), 5);
        assert_eq!(segment.flush().unwrap(), 0);
        assert!(segment.is_fully_flushed());

        segment.write(b"!").unwrap();
        assert_eq!(segment.flush().unwrap(), 1);
        assert_eq!(segment.flushed(), 6);
    }

    #[test]
    fn test_segment_truncate_zeroes_tail() {
        let dir = TempDir::new().unwrap();
        let segment = MappedSegment::create(dir.path(), 0, 1024).unwrap();
        segment.write(b"abcde").unwrap();
        segment.flush().unwrap();

        segment.truncate_to(3).unwrap();
        assert_eq!(segment.wrote(), 3);
        assert_eq!(segment.flushed(), 3);
        assert_eq!(segment.committed(), 3);
        assert!(segment.read(3, 1).is_err());
        segment.with_bytes(|bytes| {
            assert_eq!(&bytes[..3], b"abc");
            assert!(bytes[3..5].iter().all(|b| *b == 0));
        });

        assert!(segment.truncate_to(4).is_err());
    }

    #[test]
    fn test_segment_seal() {
        let dir = TempDir::new().unwrap();
        let segment = MappedSegment::create(dir.path(), 0, 64).unwrap();
        segment.write(&[7u8; 20]).unwrap();
        segment.seal(&[9, 9]);

        assert!(segment.is_full());
        assert_eq!(segment.remaining(), 0);
        segment.with_bytes(|bytes| assert_eq!(&bytes[20..22], &[9, 9]));
    }

    #[test]
    fn test_segment_reopen_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = {
            let segment = MappedSegment::create(dir.path(), 0, 1024).unwrap();
            segment.write(b"abcdef").unwrap();
            segment.flush().unwrap();
            segment.file_path().to_path_buf()
        };

        let segment = MappedSegment::open(path, 0, 1024).unwrap();
        assert_eq!(segment.wrote(), 0);

        segment.restore_position(6).unwrap();
        assert_eq!(segment.wrote(), 6);
        assert_eq!(segment.flushed(), 0);
        assert_eq!(segment.read(0, 6).unwrap(), b"abcdef");

        // bytes past the restored position are wiped
        segment.restore_position(2).unwrap();
        assert_eq!(segment.wrote(), 2);
        segment.with_bytes(|bytes| assert!(bytes[2..6].iter().all(|b| *b == 0)));
    }

    #[test]
    fn test_segment_open_rejects_wrong_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(0));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(100).unwrap();

        assert!(matches!(
            MappedSegment::open(path, 0, 1024),
            Err(StoreError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_segment_destroy_removes_file() {
        let dir = TempDir::new().unwrap();
        let segment = std::sync::Arc::new(MappedSegment::create(dir.path(), 0, 64).unwrap());
        let path = segment.file_path().to_path_buf();
        assert!(path.exists());

        segment.destroy().unwrap();
        assert!(!path.exists());
    }
}

#[cfg(test)]
mod segment_list_tests {
    use tempfile::TempDir;

    use crate::error::StoreError;
    use crate::storage::log::entry::*;
    use crate::storage::log::manager::*;

    const SEGMENT_SIZE: u64 = 256;
    // 32 byte header + 100 byte body
    const RECORD_SIZE: u64 = 132;

    fn create_test_entry(index: u64) -> LogEntry {
        LogEntry::with_index(index, 1, vec![index as u8; 100])
    }

    fn open_data_list(dir: &TempDir) -> SegmentList<DataCodec> {
        SegmentList::open(dir.path(), SEGMENT_SIZE, DataCodec::default()).unwrap()
    }

    #[test]
    fn test_append_rolls_with_blank() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        assert!(list.is_empty());
        assert_eq!(list.max_wrote_position(), 0);

        assert_eq!(list.append_record(&create_test_entry(0)).unwrap(), 0);
        // 124 bytes left, less than a record plus the blank reserve
        assert_eq!(list.append_record(&create_test_entry(1)).unwrap(), SEGMENT_SIZE);
        assert_eq!(list.segment_count(), 2);
        assert_eq!(list.max_wrote_position(), SEGMENT_SIZE + RECORD_SIZE);

        let segments = list.segments();
        assert!(segments[0].is_full());
        segments[0].with_bytes(|bytes| {
            let codec = DataCodec::default();
            assert_eq!(codec.classify(&bytes[RECORD_SIZE as usize..]), RecordKind::Blank);
        });

        let entry = list.read_record(SEGMENT_SIZE, RECORD_SIZE).unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.pos, SEGMENT_SIZE);
    }

    #[test]
    fn test_append_too_large() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        let entry = LogEntry::with_index(0, 1, vec![0u8; 250]);

        assert!(matches!(
            list.append_record(&entry),
            Err(StoreError::RecordTooLarge { max: 248, .. })
        ));
        assert!(list.is_empty());
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        assert!(matches!(list.read(0, 1), Err(StoreError::OutOfRange { .. })));

        list.append_record(&create_test_entry(0)).unwrap();
        assert!(list.read(0, RECORD_SIZE).is_ok());
        assert!(matches!(
            list.read(0, RECORD_SIZE + 1),
            Err(StoreError::OutOfRange { .. })
        ));
        assert!(matches!(
            list.read(SEGMENT_SIZE * 4, 1),
            Err(StoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_truncate_across_segments() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        for i in 0..3 {
            list.append_record(&create_test_entry(i)).unwrap();
        }
        assert_eq!(list.segment_count(), 3);
        list.flush().unwrap();

        list.truncate_to(RECORD_SIZE).unwrap();
        assert_eq!(list.segment_count(), 1);
        assert_eq!(list.max_wrote_position(), RECORD_SIZE);
        assert_eq!(list.flushed_where(), RECORD_SIZE);
        assert!(!dir.path().join("00000000000000000256").exists());

        // the blank was wiped, so the next record rolls again
        assert_eq!(list.append_record(&create_test_entry(1)).unwrap(), SEGMENT_SIZE);

        assert!(matches!(
            list.truncate_to(SEGMENT_SIZE * 3),
            Err(StoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_flush_reports_bytes() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        list.append_record(&create_test_entry(0)).unwrap();
        list.append_record(&create_test_entry(1)).unwrap();

        assert_eq!(list.flushed_where(), 0);
        assert_eq!(list.flush().unwrap(), SEGMENT_SIZE + RECORD_SIZE);
        assert_eq!(list.flush().unwrap(), 0);
        assert_eq!(list.flushed_where(), SEGMENT_SIZE + RECORD_SIZE);
    }

    #[test]
    fn test_delete_oldest_segments() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        for i in 0..3 {
            list.append_record(&create_test_entry(i)).unwrap();
        }

        // nothing is flushed yet
        assert_eq!(list.delete_oldest_segments(2).unwrap(), 0);

        list.flush().unwrap();
        assert_eq!(list.delete_oldest_segments(1).unwrap(), 1);
        assert_eq!(list.min_offset(), SEGMENT_SIZE);
        assert!(matches!(list.read(0, 1), Err(StoreError::OutOfRange { .. })));

        // the tail segment always survives
        assert_eq!(list.delete_oldest_segments(10).unwrap(), 1);
        assert_eq!(list.segment_count(), 1);
        assert_eq!(list.min_offset(), SEGMENT_SIZE * 2);
    }

    #[test]
    fn test_delete_segments_before() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        for i in 0..3 {
            list.append_record(&create_test_entry(i)).unwrap();
        }
        list.flush().unwrap();

        assert_eq!(list.delete_segments_before(SEGMENT_SIZE + 1).unwrap(), 1);
        assert_eq!(list.min_offset(), SEGMENT_SIZE);
    }

    #[test]
    fn test_scan_and_recover_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let list = open_data_list(&dir);
            for i in 0..3 {
                list.append_record(&create_test_entry(i)).unwrap();
            }
            list.flush().unwrap();
        }

        let list = open_data_list(&dir);
        assert_eq!(list.segment_count(), 3);

        let codec = DataCodec::default();
        let mut seen = Vec::new();
        let end = list
            .scan(list.min_offset(), |offset, bytes| {
                seen.push((offset, codec.decode(offset, bytes)?.index));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![(0, 0), (SEGMENT_SIZE, 1), (SEGMENT_SIZE * 2, 2)]);
        assert_eq!(end, SEGMENT_SIZE * 2 + RECORD_SIZE);

        list.recover_to(end).unwrap();
        assert_eq!(list.max_wrote_position(), end);
        assert_eq!(list.read_record(SEGMENT_SIZE * 2, RECORD_SIZE).unwrap().index, 2);
        assert_eq!(
            list.append_record(&create_test_entry(3)).unwrap(),
            SEGMENT_SIZE * 3
        );
    }

    #[test]
    fn test_scan_stops_when_visitor_declines() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        for i in 0..3 {
            list.append_record(&create_test_entry(i)).unwrap();
        }

        let end = list.scan(0, |offset, _| Ok(offset < SEGMENT_SIZE)).unwrap();
        assert_eq!(end, SEGMENT_SIZE);
    }

    #[test]
    fn test_recover_drops_segments_past_end() {
        let dir = TempDir::new().unwrap();
        {
            let list = open_data_list(&dir);
            for i in 0..3 {
                list.append_record(&create_test_entry(i)).unwrap();
            }
            list.flush().unwrap();
        }

        let list = open_data_list(&dir);
        list.recover_to(SEGMENT_SIZE + RECORD_SIZE).unwrap();
        assert_eq!(list.segment_count(), 2);
        assert_eq!(list.max_wrote_position(), SEGMENT_SIZE + RECORD_SIZE);
    }

    #[test]
    fn test_fixed_width_list() {
        let dir = TempDir::new().unwrap();
        let unit = INDEX_UNIT_SIZE as u64;

        assert!(matches!(
            SegmentList::open(dir.path(), 100, IndexCodec::default()),
            Err(StoreError::Config(_))
        ));

        let list = SegmentList::open(dir.path(), unit * 4, IndexCodec::default()).unwrap();
        for i in 0..5 {
            let record = IndexUnit {
                entry_index: i,
                entry_term: 1,
                data_offset: i * 100,
                entry_size: 100,
                flags: INDEX_UNIT_VALID,
            };
            assert_eq!(list.append_record(&record).unwrap(), i * unit);
        }
        assert_eq!(list.segment_count(), 2);
        assert_eq!(list.read_record(unit * 4, unit).unwrap().entry_index, 4);

        assert!(matches!(
            list.append(&[0u8; 8]),
            Err(StoreError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_reset_to_unaligned_offset() {
        let dir = TempDir::new().unwrap();
        let unit = INDEX_UNIT_SIZE as u64;
        let list = SegmentList::open(dir.path(), unit * 4, IndexCodec::default()).unwrap();
        list.append_record(&IndexUnit::default()).unwrap();

        list.reset_to(unit * 7).unwrap();
        assert_eq!(list.segment_count(), 1);
        assert_eq!(list.min_offset(), unit * 4);
        assert_eq!(list.max_wrote_position(), unit * 7);
        assert_eq!(list.append_record(&IndexUnit::default()).unwrap(), unit * 7);
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let list = open_data_list(&dir);
        list.append_record(&create_test_entry(0)).unwrap();
        list.append_record(&create_test_entry(1)).unwrap();

        let stats = list.stats();
        assert_eq!(stats.segment_count, 2);
        assert_eq!(stats.disk_usage(), SEGMENT_SIZE * 2);
        assert_eq!(stats.unflushed_bytes, SEGMENT_SIZE + RECORD_SIZE);
        assert!(stats.to_human_readable().starts_with("segments: 2 x 256B"));
    }
}
