use std::{collections::HashMap, fmt::Write, ops::Bound, str::FromStr, sync::Arc};

use bytes::Bytes;

use super::{
    cell::Cell,
    column_family::ColumnFamily,
    data_range::DataRange,
    decorated_key::{DecoratedKey, KeyRange},
    deletion::{DeletionTime, RangeTombstone},
    CacheOptions, ColumnFamilyStore,
};
use crate::{
    composites::CellName,
    config::{CfMetaData, TableOptions},
    filter::{ColumnSlice, DiskAtomFilter, NamesQueryFilter, SliceQueryFilter},
    fs::MockDir,
    sst::test::row,
};

fn table() -> Arc<CfMetaData> {
    Arc::new(
        CfMetaData::new(
            TableOptions::from_json(
                r#"{
                    "keyspace": "ks",
                    "name": "t",
                    "comparator": "CompositeType(Int32Type,UTF8Type)",
                    "columns": [
                        {"name": "a", "validator": "UTF8Type", "kind": "regular"},
                        {"name": "b", "validator": "UTF8Type", "kind": "regular"}
                    ],
                    "gc_grace_seconds": 10
                }"#,
            )
            .unwrap(),
        )
        .unwrap(),
    )
}

fn open(dir: &MockDir, md: &Arc<CfMetaData>) -> ColumnFamilyStore<MockDir> {
    let caches = CacheOptions {
        row_cache_rows: 100,
        ..CacheOptions::default()
    };
    ColumnFamilyStore::open(dir.clone(), md.clone(), caches).unwrap()
}

fn arg<T>(args: &HashMap<String, Vec<String>>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    args.get(name).map(|v| v[0].parse().unwrap())
}

// `1:a` is column `a` of the row clustered at 1.
fn parse_name(md: &CfMetaData, s: &str) -> CellName {
    let (r, c) = s.split_once(':').unwrap();
    md.comparator
        .create(&row(r.parse().unwrap()), c.as_bytes())
        .unwrap()
}

fn parse_rows(s: &str) -> (i32, i32) {
    let (from, to) = s.split_once("..").unwrap();
    (from.parse().unwrap(), to.parse().unwrap())
}

// One line per atom:
//   1:a=value@ts    a cell
//   1:a=-@ts        a cell tombstone
//   del 1..2@ts     a range tombstone over rows 1 to 2
//   del @ts         a partition deletion
fn parse_update(md: &Arc<CfMetaData>, input: &str, now: i32) -> ColumnFamily {
    let mut cf = ColumnFamily::new(md.clone());
    for line in input.lines() {
        let (what, ts) = line.rsplit_once('@').unwrap();
        let ts: i64 = ts.parse().unwrap();
        if let Some(rows) = what.strip_prefix("del") {
            let deletion = DeletionTime::new(ts, now);
            match rows.trim() {
                "" => cf.delete_partition(deletion),
                rows => {
                    let (from, to) = parse_rows(rows);
                    cf.add_range_tombstone(RangeTombstone::new(
                        row(from).start(),
                        row(to).end(),
                        deletion,
                    ));
                }
            }
            continue;
        }
        let (name, value) = what.split_once('=').unwrap();
        let name = parse_name(md, name);
        cf.add_cell(match value {
            "-" => Cell::tombstone(name, ts, now),
            v => Cell::new(name, Bytes::copy_from_slice(v.as_bytes()), ts),
        });
    }
    cf
}

fn format_row(key: &DecoratedKey, cf: &ColumnFamily) -> String {
    let comparator = cf.comparator();
    let mut out = format!("{}:", String::from_utf8_lossy(key.key()));
    let top_level = cf.deletion_info().top_level();
    if !top_level.is_live() {
        write!(&mut out, " deleted@{}", top_level.marked_for_delete_at).unwrap();
    }
    for rt in cf.deletion_info().ranges() {
        write!(
            &mut out,
            " [{}, {}]@{}",
            comparator.get_string(&rt.min).unwrap(),
            comparator.get_string(&rt.max).unwrap(),
            rt.data.marked_for_delete_at
        )
        .unwrap();
    }
    for cell in cf.cells() {
        let name = comparator.get_string(&cell.name).unwrap();
        if cell.is_tombstone() {
            write!(&mut out, " {}=-@{}", name, cell.timestamp).unwrap();
        } else {
            write!(
                &mut out,
                " {}={}@{}",
                name,
                String::from_utf8_lossy(&cell.value),
                cell.timestamp
            )
            .unwrap();
        }
    }
    out.push('\n');
    out
}

fn or_none(out: String, none: &str) -> String {
    if out.is_empty() {
        format!("{}\n", none)
    } else {
        out
    }
}

#[test]
fn test_store_trace() {
    datadriven::walk("src/db/testdata/", |f| {
        let dir = MockDir::new();
        let md = table();
        let mut store = open(&dir, &md);
        f.run(|test_case| match test_case.directive.as_str() {
            "apply" => {
                let key: String = arg(&test_case.args, "key").expect("apply requires key");
                let now = arg(&test_case.args, "now").unwrap_or(0);
                store.apply(DecoratedKey::new(key), parse_update(&md, &test_case.input, now));
                "ok\n".into()
            }
            "flush" => match store.flush_memtable().unwrap() {
                Some(name) => format!("{}\n", name),
                None => "nothing to flush\n".into(),
            },
            "scan" => {
                let args = &test_case.args;
                let reversed = args.contains_key("reversed");
                let slice = match arg::<String>(args, "rows") {
                    Some(rows) => {
                        let (from, to) = parse_rows(&rows);
                        if reversed {
                            ColumnSlice::new(row(to).end(), row(from).start())
                        } else {
                            ColumnSlice::new(row(from).start(), row(to).end())
                        }
                    }
                    None => ColumnSlice::all(),
                };
                let limit = arg(args, "limit").unwrap_or(usize::MAX);
                let keys = KeyRange::new(
                    arg::<String>(args, "start")
                        .map_or(Bound::Unbounded, |k| Bound::Included(DecoratedKey::new(k))),
                    arg::<String>(args, "end")
                        .map_or(Bound::Unbounded, |k| Bound::Excluded(DecoratedKey::new(k))),
                );
                let mut range = DataRange::new(
                    keys,
                    DiskAtomFilter::Slice(SliceQueryFilter::new(vec![slice], reversed, limit)),
                );
                if let Some(page) = arg::<String>(args, "page") {
                    let from: i32 = arg(args, "from").expect("page requires from");
                    range = range
                        .paged(DecoratedKey::new(page), row(from).start())
                        .unwrap();
                }
                let now = arg(args, "now").unwrap_or(0);
                let mut out = String::new();
                for r in store.get_range_slice(range, now).unwrap() {
                    let (key, cf) = r.unwrap();
                    out.push_str(&format_row(&key, &cf));
                }
                or_none(out, "(no rows)")
            }
            "get" => {
                let key = DecoratedKey::new(arg::<String>(&test_case.args, "key").expect("get requires key"));
                let now = arg(&test_case.args, "now").unwrap_or(0);
                let filter = if test_case.input.trim().is_empty() {
                    DiskAtomFilter::Slice(SliceQueryFilter::all())
                } else {
                    DiskAtomFilter::Names(NamesQueryFilter::new(
                        &md.comparator,
                        test_case.input.lines().map(|l| parse_name(&md, l.trim())),
                    ))
                };
                match store.get_column_family(&key, filter, now).unwrap() {
                    Some(cf) => format_row(&key, &cf),
                    None => "(no rows)\n".into(),
                }
            }
            "cache" => {
                let key: String = arg(&test_case.args, "key").expect("cache requires key");
                let now = arg(&test_case.args, "now").unwrap_or(0);
                format!("{}\n", store.cache_row(&DecoratedKey::new(key), now).unwrap())
            }
            "trace" => {
                let mut result = String::new();
                for event in (*dir.fs).borrow_mut().take_events() {
                    event.write_abbrev(&mut result).unwrap();
                    result.push('\n');
                }
                if test_case.args.contains_key("squelch") {
                    "ok\n".into()
                } else {
                    or_none(result, "(no events)")
                }
            }
            "dump" => {
                let mut out = String::new();
                for line in test_case.input.lines() {
                    match line.trim() {
                        "root" => writeln!(&mut out, "{:#?}", store.root.data).unwrap(),
                        "segments" => {
                            for segment in store.segments() {
                                writeln!(
                                    &mut out,
                                    "{}: {} partitions",
                                    segment.name(),
                                    segment.stats().partitions
                                )
                                .unwrap();
                            }
                        }
                        "memtable" => {
                            writeln!(&mut out, "{} operations", store.memtable().operations()).unwrap()
                        }
                        _ => writeln!(&mut out, "can't dump {:?}", line.trim()).unwrap(),
                    }
                }
                out
            }
            "reload" => {
                store = open(&dir, &md);
                "ok\n".into()
            }
            _ => {
                panic!("unhandled");
            }
        })
    })
}
