use std::io::Cursor;

use ats_verify_core::{
    MarketplaceDirectory, Normalizer, NormalizerConfig, RowReader, UploadContext, UserId,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;

fn mk_parcel_csv(rows: usize) -> Vec<u8> {
    let mut out = String::from("marketplace,country,brand,product_name,track_number,serial_ref,date\n");
    for index in 0..rows {
        let date = if index % 3 == 0 { "14.03.2026" } else { "2026-03-14" };
        out.push_str(&format!(
            "Ozon,KZ,\"Acme, Ltd\",Kettle {index},TRK{index:08},<nil>,{date}\n"
        ));
    }
    out.into_bytes()
}

fn mk_risk_csv(rows: usize) -> Vec<u8> {
    let mut out = String::from(
        "date;application_id;iin;document;user;org;status;reject;reason\n",
    );
    for index in 0..rows {
        let status = if index % 2 == 0 { "NEW" } else { "REJECTED" };
        out.push_str(&format!(
            "2026-01-{day:02};APP-{index};{iin:012};DOC-{doc};user;org;{status};0;\n",
            day = index % 28 + 1,
            iin = 900_000_000_000_u64 + (index % 500) as u64,
            doc = index % 700,
        ));
    }
    out.into_bytes()
}

fn bench_parcels(c: &mut Criterion) {
    let input = mk_parcel_csv(10_000);
    let normalizer = Normalizer::new(
        NormalizerConfig::default(),
        MarketplaceDirectory::from_pairs([("wb", "Wildberries"), ("ozon", "Ozon")]),
    );
    let context = UploadContext { uploader_id: UserId::new(), marketplace_prefix: None };
    let now = OffsetDateTime::UNIX_EPOCH;

    c.bench_function("read_and_normalize_10000_parcel_rows", |b| {
        b.iter(|| {
            let mut accepted = 0_usize;
            for row in RowReader::new(Cursor::new(input.as_slice())).skip(1) {
                let row = row.unwrap_or_else(|err| panic!("parcel benchmark row failed: {err}"));
                if normalizer.parcel(&row, &context, now).is_ok() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 10_000);
        });
    });
}

fn bench_risk(c: &mut Criterion) {
    let input = mk_risk_csv(10_000);
    let normalizer = Normalizer::default();
    let now = OffsetDateTime::UNIX_EPOCH;

    c.bench_function("read_and_normalize_10000_risk_rows", |b| {
        b.iter(|| {
            let mut accepted = 0_usize;
            for row in RowReader::new(Cursor::new(input.as_slice())).skip(1) {
                let row = row.unwrap_or_else(|err| panic!("risk benchmark row failed: {err}"));
                if normalizer.raw_signal(&row, now).is_ok() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 10_000);
        });
    });
}

criterion_group!(ingest_benches, bench_parcels, bench_risk);
criterion_main!(ingest_benches);
