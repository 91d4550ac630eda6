use refrefine::refine::query::{extract_surname, generate_queries, validate_query, MAX_QUERY_LEN};
use refrefine::{BibliographicRecord, QueryConfig, QueryType, RefineError};

fn filter_bubble() -> BibliographicRecord {
    BibliographicRecord::new(1, "The filter bubble")
        .with_author("Pariser, E.")
        .with_year("2011")
        .with_publication("Penguin Press")
}

const FREE_ACCESS: &[&str] = &["site:edu", "site:gov", "site:archive.org", "free full text"];

#[test]
fn test_surname_extraction() {
    assert_eq!(extract_surname("Smith, J."), "Smith");
    assert_eq!(extract_surname("Smith"), "Smith");
    assert_eq!(extract_surname("van der Berg, A."), "van");
    assert_eq!(extract_surname("John Smith"), "Smith");
    assert_eq!(extract_surname("Smith, J. and Doe, K."), "Smith");
    assert_eq!(extract_surname(""), "");
}

#[test]
fn test_validate_query() {
    assert!(validate_query("short query with meaning"));
    assert!(!validate_query("a"));
    assert!(!validate_query("the and or"));
    assert!(!validate_query(""));
    assert!(!validate_query(&"x".repeat(130)));
    assert!(!validate_query(&"word ".repeat(26)));
}

#[test]
fn test_filter_bubble_queries() {
    let queries = generate_queries(&filter_bubble(), &QueryConfig::default()).unwrap();
    assert_eq!(queries.len(), 8);

    let primary: Vec<_> = queries.iter().filter(|q| q.query_type == QueryType::Primary).collect();
    let secondary: Vec<_> = queries.iter().filter(|q| q.query_type == QueryType::Secondary).collect();
    assert_eq!(primary.len(), 4);
    assert_eq!(secondary.len(), 4);

    for q in &primary {
        assert!(q.text.contains("The filter bubble"), "primary query: {}", q.text);
        assert!(q.text.contains("Pariser"), "primary query: {}", q.text);
    }
    for q in &secondary {
        let lower = q.text.to_lowercase();
        assert!(
            ["review", "critique", "analysis", "discussion", "commentary", "criticism"]
                .iter()
                .any(|t| lower.contains(t)),
            "secondary query: {}",
            q.text
        );
    }
    assert!(primary.iter().any(|q| FREE_ACCESS.iter().any(|m| q.text.contains(m))));

    let primary_numbers: Vec<u32> = primary.iter().map(|q| q.query_number).collect();
    let secondary_numbers: Vec<u32> = secondary.iter().map(|q| q.query_number).collect();
    assert_eq!(primary_numbers, vec![1, 2, 3, 4]);
    assert_eq!(secondary_numbers, vec![1, 2, 3, 4]);
    assert!(queries.iter().all(|q| q.rid == 1));
}

#[test]
fn test_title_only_record() {
    let bib = BibliographicRecord::new(7, "Deep Learning");
    let queries = generate_queries(&bib, &QueryConfig::default()).unwrap();
    assert_eq!(queries.len(), 8);
    for q in &queries {
        assert!(!q.text.is_empty());
        assert!(q.text.chars().count() <= MAX_QUERY_LEN);
        assert!(validate_query(&q.text), "invalid query: {}", q.text);
    }
}

#[test]
fn test_author_only_record_still_fills_counts() {
    let bib = BibliographicRecord::new(8, "").with_author("Smith, J.");
    let config = QueryConfig {
        primary_query_count: 4,
        secondary_query_count: 4,
    };
    let queries = generate_queries(&bib, &config).unwrap();
    assert_eq!(queries.len(), 8);
    assert!(queries.iter().all(|q| q.text.contains("Smith")));
}

#[test]
fn test_long_title_is_shortened() {
    let title = format!("{}: {}", "Structural analysis of ".repeat(6).trim(), "a subtitle ".repeat(10).trim());
    let bib = BibliographicRecord::new(9, title)
        .with_author("Okonkwo, C.")
        .with_year("1999")
        .with_publication("Journal of Very Long Publication Names and Other Things");
    let queries = generate_queries(&bib, &QueryConfig::default()).unwrap();
    assert_eq!(queries.len(), 8);
    for q in &queries {
        assert!(q.text.chars().count() <= MAX_QUERY_LEN, "too long: {}", q.text);
        assert!(!q.text.trim().is_empty());
    }
}

#[test]
fn test_custom_counts() {
    let config = QueryConfig {
        primary_query_count: 6,
        secondary_query_count: 2,
    };
    let queries = generate_queries(&filter_bubble(), &config).unwrap();
    assert_eq!(queries.iter().filter(|q| q.query_type == QueryType::Primary).count(), 6);
    assert_eq!(queries.iter().filter(|q| q.query_type == QueryType::Secondary).count(), 2);
}

#[test]
fn test_no_usable_text_is_input_missing() {
    let bib = BibliographicRecord::new(42, "");
    match generate_queries(&bib, &QueryConfig::default()) {
        Err(RefineError::InputMissing(rid)) => assert_eq!(rid, 42),
        other => panic!("expected InputMissing, got {:?}", other),
    }

    let punctuation = BibliographicRecord::new(43, "!!! ---").with_author("...");
    assert!(matches!(
        generate_queries(&punctuation, &QueryConfig::default()),
        Err(RefineError::InputMissing(43))
    ));
}
