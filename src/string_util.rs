use url::Url;

const FILE_SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

pub trait StrUtil {
    fn trim_right_slash(&self) -> &str;
}

impl StrUtil for str {
    fn trim_right_slash(&self) -> &str {
        self.trim_end_matches('/')
    }
}

/// Human readable file size, e.g. `1.5 MB`.
/// Uses 1024 based units and keeps at most two decimals.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut exp = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && exp < FILE_SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        exp += 1;
    }

    let rounded = format!("{:.2}", value);
    let rounded = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", rounded, FILE_SIZE_UNITS[exp])
}

/// Builds a filesystem safe name out of the last path segment of `url`.
/// ## Arguments:
/// * `extension` - appended as is, so it should contain the leading dot
/// * `timestamp` - makes names of repeated downloads unique
pub fn safe_filename(url: &str, extension: &str, prefix: &str, timestamp: i64) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return format!("{prefix}_{timestamp}{extension}");
    };
    let content_id = parsed.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("content");

    let safe_name: String = content_id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();

    format!("{prefix}_{safe_name}_{timestamp}{extension}")
}

#[test]
fn test_trim_right_slash() {
    assert_eq!("/aaa/bbb/".trim_right_slash(), "/aaa/bbb");
    assert_eq!("/aaa/bbb///".trim_right_slash(), "/aaa/bbb");
    assert_eq!("https://insta.example/".to_string().trim_right_slash(), "https://insta.example");
}

#[test]
fn test_format_file_size() {
    assert_eq!(format_file_size(0), "0 Bytes");
    assert_eq!(format_file_size(512), "512 Bytes");
    assert_eq!(format_file_size(1024), "1 KB");
    assert_eq!(format_file_size(1536), "1.5 KB");
    assert_eq!(format_file_size(5242880), "5 MB");
    assert_eq!(format_file_size(2621440), "2.5 MB");
    assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3 GB");
}

#[test]
fn test_safe_filename() {
    assert_eq!(
        safe_filename("https://www.instagram.com/p/C0d3_x-Y/", ".jpg", "instagram", 1700000000000),
        "instagram_C0d3_x-Y_1700000000000.jpg"
    );
    assert_eq!(
        safe_filename("https://www.instagram.com/stories/some.user/", "", "story", 1),
        "story_some_user_1"
    );
    assert_eq!(safe_filename("https://www.instagram.com/", ".mp4", "instagram", 7), "instagram_content_7.mp4");
    assert_eq!(safe_filename("not a url", ".jpg", "instagram", 7), "instagram_7.jpg");
}
