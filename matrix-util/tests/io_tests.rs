use matrix_util::common_io::*;

#[test]
fn gz_lines_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("names.txt.gz");
    let file = file.to_str().unwrap();

    let lines: Vec<Box<str>> = vec!["HSC".into(), "GMP".into(), "Early ProB".into()];
    write_lines(&lines, file)?;

    assert_eq!(read_lines(file)?, lines);
    Ok(())
}

#[test]
fn words_skip_comments_and_take_header() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("sets.txt");
    std::fs::write(&file, "# gene sets
name genes
HSC  CD34 HLF
% note
GMP	MPO
")?;

    let ReadLinesOut { lines, header } = read_lines_of_words(file.to_str().unwrap(), 0)?;

    assert_eq!(header, vec![Box::from("name"), Box::from("genes")]);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].len(), 3);
    assert_eq!(&*lines[1][1], "MPO");
    Ok(())
}

#[test]
fn csv_words_keep_empty_fields() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("meta.csv");
    std::fs::write(&file, "cell,donor,note\nc1,d1,\nc2,d2,x\n")?;
    let file = file.to_str().unwrap();

    let ReadLinesOut { lines, header } = read_lines_of_words_delim(file, detect_delimiter(file), 0)?;
    assert_eq!(header.len(), 3);
    assert_eq!(lines[0].len(), 3);
    assert_eq!(&*lines[0][2], "");
    assert_eq!(&*lines[1][1], "d2");
    Ok(())
}

#[test]
fn file_ext_looks_through_gz() -> anyhow::Result<()> {
    assert_eq!(&*file_ext("out/annot.tsv.gz")?, "tsv");
    assert_eq!(&*file_ext("out/annot.parquet")?, "parquet");
    assert!(file_ext("out/atlas").is_err());
    Ok(())
}
