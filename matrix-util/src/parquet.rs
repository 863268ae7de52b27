use parquet::basic::Type as ParquetType;
use parquet::basic::{Compression, ConvertedType, Repetition, ZstdLevel};
use parquet::data_type::{ByteArray, ByteArrayType, FloatType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::types::Type;
use std::fs::File;
use std::sync::Arc;

/// A nullable column of a flat table
pub enum TableColumn {
    Str(Vec<Option<Box<str>>>),
    Float(Vec<Option<f32>>),
}

impl TableColumn {
    pub fn len(&self) -> usize {
        match self {
            TableColumn::Str(v) => v.len(),
            TableColumn::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn physical_type(&self) -> ParquetType {
        match self {
            TableColumn::Str(_) => ParquetType::BYTE_ARRAY,
            TableColumn::Float(_) => ParquetType::FLOAT,
        }
    }
}

pub struct ParquetWriter {
    file: std::fs::File,
    schema: Arc<Type>,
    writer_properties: Arc<WriterProperties>,
}

impl ParquetWriter {
    /// Create a new parquet writer for a table of named, nullable
    /// columns
    ///
    /// * `file_path`: output file path
    ///
    /// * `column_names`: one per column
    ///
    /// * `columns`: the column data (only the types are read here)
    ///
    pub fn new(
        file_path: &str,
        column_names: &[Box<str>],
        columns: &[TableColumn],
    ) -> anyhow::Result<Self> {
        let schema = build_columns_schema(column_names, columns)?;

        let file = std::fs::File::create(file_path)?;

        let zstd_level = ZstdLevel::try_new(5)?;
        let writer_properties = Arc::new(
            WriterProperties::builder()
                .set_compression(Compression::ZSTD(zstd_level))
                .build(),
        );

        Ok(Self {
            file,
            schema,
            writer_properties,
        })
    }

    pub fn open(&self) -> anyhow::Result<SerializedFileWriter<File>> {
        Ok(SerializedFileWriter::new(
            self.file.try_clone()?,
            self.schema.clone(),
            self.writer_properties.clone(),
        )?)
    }
}

/// Write a flat table into a single row group
pub fn write_parquet_table(
    file_path: &str,
    column_names: &[Box<str>],
    columns: &[TableColumn],
) -> anyhow::Result<()> {
    if let Some(first) = columns.first() {
        if columns.iter().any(|c| c.len() != first.len()) {
            return Err(anyhow::anyhow!("columns differ in length"));
        }
    }

    let writer = ParquetWriter::new(file_path, column_names, columns)?;
    let mut writer = writer.open()?;
    let mut row_group_writer = writer.next_row_group()?;

    for column in columns {
        let mut col_writer = row_group_writer
            .next_column()?
            .ok_or_else(|| anyhow::anyhow!("schema has fewer columns than data"))?;

        match column {
            TableColumn::Str(values) => {
                let (data, def) = split_nulls(values, |x| ByteArray::from(x.as_ref()));
                col_writer
                    .typed::<ByteArrayType>()
                    .write_batch(&data, Some(&def), None)?;
            }
            TableColumn::Float(values) => {
                let (data, def) = split_nulls(values, |x| *x);
                col_writer
                    .typed::<FloatType>()
                    .write_batch(&data, Some(&def), None)?;
            }
        }
        col_writer.close()?;
    }

    row_group_writer.close()?;
    writer.close()?;
    Ok(())
}

/// non-null values and definition levels (1 = present, 0 = null)
fn split_nulls<T, U>(values: &[Option<T>], convert: impl Fn(&T) -> U) -> (Vec<U>, Vec<i16>) {
    let mut data = Vec::with_capacity(values.len());
    let mut def = Vec::with_capacity(values.len());
    for v in values {
        match v {
            Some(x) => {
                data.push(convert(x));
                def.push(1);
            }
            None => def.push(0),
        }
    }
    (data, def)
}

fn build_columns_schema(
    column_names: &[Box<str>],
    columns: &[TableColumn],
) -> anyhow::Result<Arc<Type>> {
    if column_names.len() != columns.len() {
        return Err(anyhow::anyhow!(
            "Column names length ({}) does not match number of columns ({})",
            column_names.len(),
            columns.len()
        ));
    }

    let mut fields = Vec::with_capacity(columns.len());

    for (name, column) in column_names.iter().zip(columns.iter()) {
        let mut builder = Type::primitive_type_builder(name, column.physical_type())
            .with_repetition(Repetition::OPTIONAL);
        if let TableColumn::Str(_) = column {
            builder = builder.with_converted_type(ConvertedType::UTF8);
        }
        fields.push(Arc::new(builder.build()?));
    }

    let schema = Arc::new(Type::group_type_builder("table").with_fields(fields).build()?);

    Ok(schema)
}
