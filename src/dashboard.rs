use std::sync::Arc;

use build_html::Html;
use build_html::HtmlContainer;
use build_html::Table;
use build_html::{Container, ContainerType, HtmlPage};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::cluster::Cluster;
use crate::humanfmt::HumanFmt;
use crate::{APP_VERSION, LOGSTORE, NodeBody, RUNTIMEDETAILS, quick_response};

const DASHBOARD_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[day] [month repr:short] [year] [hour]:[minute]:[second]");

pub(crate) async fn serve(cluster: &Arc<Cluster>, sub: &str) -> Response<NodeBody> {
    match sub {
        "" | "index.html" => serve_status(cluster),
        "logs" => serve_logs(),
        _ => quick_response(StatusCode::NOT_FOUND, "404 page not found"),
    }
}

fn build_storage_table(cluster: &Arc<Cluster>) -> Table {
    let mut table = Table::new().with_header_row(["Name", "Type", "Weight"]);
    for (sto, weight) in cluster.storages().iter().zip(cluster.storage_weights()) {
        table.add_body_row([
            sto.name().to_string(),
            sto.kind().to_string(),
            weight.to_string(),
        ]);
    }
    table
}

fn build_access_table(cluster: &Arc<Cluster>) -> Table {
    let mut table = Table::new().with_header_row(["User Agent", "Requests"]);

    let mut accesses: Vec<(String, i64)> = cluster
        .stats
        .accesses
        .read()
        .expect("other users should not panic")
        .iter()
        .map(|(ua, count)| (ua.clone(), *count))
        .collect();
    accesses.sort_unstable_by_key(|(_, count)| -*count);

    for (ua, count) in accesses {
        table.add_body_row([ua, count.to_string()]);
    }
    table
}

#[must_use]
fn serve_status(cluster: &Arc<Cluster>) -> Response<NodeBody> {
    let rd = RUNTIMEDETAILS.get().expect("global is set in main()");
    let (hits, hbts, stat_hits, stat_hbts) = cluster.counters();
    #[expect(clippy::cast_precision_loss)]
    let hbts_fmt = format!("{}", HumanFmt::Bytes(hbts as f64));
    #[expect(clippy::cast_precision_loss)]
    let stat_hbts_fmt = format!("{}", HumanFmt::Bytes(stat_hbts as f64));

    let html: String = HtmlPage::new()
        .with_title("bmclapi-node-rs dashboard")
        .with_header(1, "Node Status")
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Node Details")
                .with_paragraph(format!(
                    "Version: {}<br>Start Time: {}<br>Current Time: {}<br>Enabled: {}<br>Indexed Files: {}<br>Copy Slots: {} free of {}",
                    APP_VERSION,
                    rd.start_time
                        .format(DASHBOARD_DATE_FORMAT)
                        .expect("timestamp should be formattable"),
                    OffsetDateTime::now_utc()
                        .format(DASHBOARD_DATE_FORMAT)
                        .expect("timestamp should be formattable"),
                    cluster.is_enabled(),
                    cluster.file_index.len(),
                    cluster.buf_slots().len(),
                    cluster.buf_slots().cap(),
                ))
                .with_link("/dashboard/logs", "Warnings"),
        )
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Served Downloads")
                .with_paragraph(format!(
                    "Keepalive: {hits} hits, {hbts_fmt}<br>Other: {stat_hits} hits, {stat_hbts_fmt}"
                )),
        )
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Storages")
                .with_table(build_storage_table(cluster)),
        )
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Requests by User Agent")
                .with_table(build_access_table(cluster)),
        )
        .with_container(
            Container::new(ContainerType::Footer)
                .with_paragraph("<hr>All dates are in UTC."),
        )
        .to_html_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .body(crate::full(html))
        .expect("response is valid")
}

#[must_use]
fn serve_logs() -> Response<NodeBody> {
    let mut buf = Vec::with_capacity(8192);

    let store = LOGSTORE.get().expect("global is set in main()");
    for entry in store.snapshot() {
        buf.extend_from_slice(entry.as_bytes());
        buf.push(b'\n');
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(crate::full(buf))
        .expect("response is valid")
}
