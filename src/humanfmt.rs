#[must_use]
pub(crate) enum HumanFmt {
    /// Byte count, formatted the way the authority's reports expect:
    /// plain bytes below 1000, then 1024-based units with one decimal.
    Bytes(f64),
    Time(std::time::Duration),
}

impl std::fmt::Display for HumanFmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Bytes(size) => {
                if size < 1000.0 {
                    #[expect(clippy::cast_possible_truncation)]
                    return f.write_fmt(format_args!("{}B", size as i64));
                }
                let mut size = size / 1024.0;
                let mut unit = "KB";
                if size >= 1000.0 {
                    size /= 1024.0;
                    unit = "MB";
                    if size >= 1000.0 {
                        size /= 1024.0;
                        unit = "GB";
                        if size >= 1000.0 {
                            size /= 1024.0;
                            unit = "TB";
                        }
                    }
                }
                f.write_fmt(format_args!("{size:.1}{unit}"))
            }
            Self::Time(time) => {
                let nanos = time.as_nanos();
                if nanos < 1000 {
                    return f.write_fmt(format_args!("{nanos}ns"));
                }
                #[expect(clippy::cast_precision_loss)]
                let mut t = nanos as f64 / 1000.0;
                if t < 1000.0 {
                    return f.write_fmt(format_args!("{t:.1}us"));
                }
                t /= 1000.0;
                if t < 1000.0 {
                    return f.write_fmt(format_args!("{t:.1}ms"));
                }
                t /= 1000.0;
                if t < 600.0 {
                    return f.write_fmt(format_args!("{t:.2}s"));
                }

                let total = time.as_secs();
                let secs = total % 60;
                let mins = (total / 60) % 60;
                let hours = total / 3600;
                if hours != 0 {
                    f.write_fmt(format_args!("{hours}h{mins}m{secs}s"))
                } else {
                    f.write_fmt(format_args!("{mins}m{secs}s"))
                }
            }
        }
    }
}
