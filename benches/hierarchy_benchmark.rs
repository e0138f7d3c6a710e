use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mobile_pilot::device::parse_hierarchy;
use mobile_pilot::perception::Snapshot;
use mobile_pilot::ScreenSize;

fn dump(rows: usize) -> String {
    let mut xml = String::from(
        r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0">"#,
    );
    xml.push_str(r#"<node index="0" text="" resource-id="" class="android.widget.FrameLayout" content-desc="" clickable="false" enabled="true" scrollable="true" bounds="[0,0][1080,2400]">"#);
    for i in 0..rows {
        let top = (i * 120) % 2400;
        xml.push_str(&format!(
            r#"<node index="{i}" text="Item {i}" resource-id="com.example:id/row" class="android.widget.TextView" content-desc="" clickable="true" enabled="true" scrollable="false" bounds="[0,{top}][1080,{bottom}]" />"#,
            bottom = top + 110,
        ));
    }
    xml.push_str("</node></hierarchy>");
    xml
}

fn benchmark_hierarchy(c: &mut Criterion) {
    let xml = dump(200);

    c.bench_function("parse_hierarchy_200_nodes", |b| {
        b.iter(|| {
            let elements = parse_hierarchy(black_box(&xml));
            assert!(elements.is_ok());
        })
    });

    let elements = parse_hierarchy(&xml).unwrap_or_default();
    c.bench_function("snapshot_normalize_200_nodes", |b| {
        b.iter(|| {
            Snapshot::new(
                ScreenSize::new(1080, 2400),
                Vec::new(),
                black_box(elements.clone()),
            )
        })
    });
}

criterion_group!(benches, benchmark_hierarchy);
criterion_main!(benches);
