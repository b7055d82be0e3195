//! Prompts for the two remote calls of the pipeline.
//!
//! Kept in one place so prompt changes never touch retry or quality logic,
//! and so tests can assert on the contract a prompt establishes (stop
//! marker, JSON keys) without a live model.

/// Marker the OCR model is told to emit after the last page.
///
/// Passed as a stop sequence and also cut client-side, since not every
/// provider honours stop sequences.
pub const STOP_MARKER: &str = "<<<HET_TRANG>>>";

/// System prompt for page transcription.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are a meticulous transcriber of scanned Vietnamese books on traditional medicine (Đông y).

Rules:
1. Transcribe ALL text exactly as printed, in reading order, with full Vietnamese diacritics.
2. Keep headings, numbered lists and dosage lines on their own lines.
3. Keep Latin scientific names and Chinese-Vietnamese (Hán Việt) names exactly as written.
4. Skip running headers, footers and page numbers.
5. Do not summarise, translate, explain or add commentary.
6. Never repeat a passage you have already written.
7. When the last requested page is done, write the end marker on its own line and stop."#;

/// User prompt for one page window.
pub fn ocr_page_prompt(start_page: usize, end_page: usize) -> String {
    format!(
        "Transcribe pages {start_page} to {end_page} (inclusive) of the attached document. \
         After the last page write {STOP_MARKER}"
    )
}

/// System prompt for structured extraction.
pub const STRUCTURED_SYSTEM_PROMPT: &str = r#"You extract structured records from transcribed Vietnamese traditional-medicine text.

Return ONE JSON object with exactly these keys:
{
  "vi_thuoc": [
    {"ten_vi_thuoc": "", "ten_khoa_hoc": "", "ten_khac": "", "ho": "", "bo_phan_dung": "",
     "tinh_vi": "", "quy_kinh": "", "cong_nang": "", "chu_tri": "", "lieu_dung": "", "kieng_ky": ""}
  ],
  "bai_thuoc": [
    {"ten_bai_thuoc": "", "nguon_goc": "", "cong_dung": "", "chu_tri": "", "cach_dung": "", "ghi_chu": ""}
  ],
  "cong_thuc": [
    {"ten_bai_thuoc": "", "ten_vi_thuoc": "", "lieu_luong": "", "vai_tro": ""}
  ]
}

Rules:
- Only record what the text states. Use "Không có thông tin" for any field the text does not give.
- Every ingredient line of a prescription becomes one "cong_thuc" entry.
- Use empty arrays when a kind of record is absent.
- Output JSON only, no commentary and no code fences."#;

/// User instruction preceding one transcribed slice.
pub fn structured_prompt(start_page: usize, end_page: usize) -> String {
    format!("Extract every herb, prescription and formula line from pages {start_page}-{end_page} below.")
}

/// Join an instruction and a plain-text input into one user message.
pub fn with_text_input(prompt: &str, text: &str) -> String {
    format!("{prompt}\n\n\"\"\"\n{text}\n\"\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_prompt_names_range_and_marker() {
        let p = ocr_page_prompt(171, 177);
        assert!(p.contains("pages 171 to 177"));
        assert!(p.ends_with(STOP_MARKER));
    }

    #[test]
    fn text_input_is_quoted_after_instruction() {
        let msg = with_text_input(&structured_prompt(8, 14), "Đương quy");
        assert!(msg.starts_with("Extract every herb"));
        assert!(msg.contains("pages 8-14"));
        assert!(msg.ends_with("\"\"\"\nĐương quy\n\"\"\""));
    }

    #[test]
    fn structured_prompt_lists_all_tables() {
        for key in ["\"vi_thuoc\"", "\"bai_thuoc\"", "\"cong_thuc\"", crate::config::NO_INFO] {
            assert!(STRUCTURED_SYSTEM_PROMPT.contains(key), "missing {key}");
        }
    }
}
